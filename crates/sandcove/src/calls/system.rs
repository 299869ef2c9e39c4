//! Inspection calls and supervisor options.

use std::ffi::OsString;
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};

use nix::errno::Errno;

use super::{
    CallContext, CallError, CallReply, atom_arg, bytes_arg, errno_reply, expect_args, int_arg,
};
use crate::term::Term;

fn io_errno(err: &io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

pub(super) fn version(args: &[Term]) -> Result<CallReply, CallError> {
    expect_args::<0>(args)?;
    Ok(CallReply::term(Term::binary(env!("CARGO_PKG_VERSION"))))
}

pub(super) fn getcwd(args: &[Term]) -> Result<CallReply, CallError> {
    expect_args::<0>(args)?;
    Ok(match std::env::current_dir() {
        Ok(dir) => CallReply::term(Term::ok_with(Term::binary(dir.into_os_string().into_vec()))),
        Err(err) => errno_reply(io_errno(&err)),
    })
}

pub(super) fn chdir(args: &[Term]) -> Result<CallReply, CallError> {
    let [path] = expect_args::<1>(args)?;
    let path = OsString::from_vec(bytes_arg(path)?);
    Ok(match std::env::set_current_dir(&path) {
        Ok(()) => CallReply::term(Term::ok()),
        Err(err) => errno_reply(io_errno(&err)),
    })
}

pub(super) fn gethostname(args: &[Term]) -> Result<CallReply, CallError> {
    expect_args::<0>(args)?;
    Ok(match nix::unistd::gethostname() {
        Ok(name) => CallReply::term(Term::ok_with(Term::binary(name.into_vec()))),
        Err(errno) => errno_reply(errno),
    })
}

pub(super) fn getenv(args: &[Term]) -> Result<CallReply, CallError> {
    let [name] = expect_args::<1>(args)?;
    let name = bytes_arg(name)?;
    if name.is_empty() || name.contains(&b'=') || name.contains(&0) {
        return Err(CallError::BadArgs("invalid environment variable name".into()));
    }
    let value = std::env::var_os(OsString::from_vec(name));
    Ok(CallReply::term(match value {
        Some(value) => Term::binary(value.into_vec()),
        None => Term::boolean(false),
    }))
}

pub(super) fn environ(args: &[Term]) -> Result<CallReply, CallError> {
    expect_args::<0>(args)?;
    let entries = std::env::vars_os()
        .map(|(key, value)| {
            let mut entry = key.as_bytes().to_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            Term::binary(entry)
        })
        .collect();
    Ok(CallReply::term(Term::List(entries)))
}

pub(super) fn errno_id(args: &[Term]) -> Result<CallReply, CallError> {
    let [errnum] = expect_args::<1>(args)?;
    let errnum = i32::try_from(int_arg(errnum)?).unwrap_or(0);
    Ok(CallReply::term(Term::atom(super::errno_atom(
        Errno::from_raw(errnum),
    ))))
}

pub(super) fn iolist_to_bin(args: &[Term]) -> Result<CallReply, CallError> {
    let [iolist] = expect_args::<1>(args)?;
    Ok(CallReply::term(Term::binary(bytes_arg(iolist)?)))
}

pub(super) fn getopt(ctx: &mut CallContext<'_>, args: &[Term]) -> Result<CallReply, CallError> {
    let [name] = expect_args::<1>(args)?;
    let name = atom_arg(name)?;
    Ok(CallReply::term(match ctx.config.get_option(name) {
        Some(value) => Term::Int(value),
        None => Term::boolean(false),
    }))
}

pub(super) fn setopt(ctx: &mut CallContext<'_>, args: &[Term]) -> Result<CallReply, CallError> {
    let [name, value] = expect_args::<2>(args)?;
    let name = atom_arg(name)?;
    let value = int_arg(value)?;
    let changed = ctx.config.set_option(name, value);
    if changed {
        tracing::debug!(option = name, value, "Option changed");
    }
    Ok(CallReply::term(Term::boolean(changed)))
}
