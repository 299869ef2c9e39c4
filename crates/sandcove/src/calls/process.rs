//! Process management: fork, exec, signals.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{self, Signal};
use nix::unistd::{ForkResult, Pid, pipe2};

use super::{
    CallContext, CallError, CallReply, ForkedStdio, atom_arg, bytes_arg, errno_reply,
    expect_args, int_arg,
};
use crate::bootstrap::set_nonblocking;
use crate::child::{ChildStdio, Filter, Stream};
use crate::signal::{Disposition, parse_signal, reset_for_exec, restore, set_disposition};
use crate::term::Term;

/// Signal by number or name. `Ok(None)` for signal 0 (existence probe),
/// `Err` for names and numbers this platform does not know.
fn signal_arg(term: &Term) -> Result<Result<Option<Signal>, Errno>, CallError> {
    match term {
        Term::Int(0) => Ok(Ok(None)),
        Term::Int(n) => Ok(i32::try_from(*n)
            .ok()
            .and_then(|n| Signal::try_from(n).ok())
            .map(Some)
            .ok_or(Errno::EINVAL)),
        Term::Atom(name) => Ok(parse_signal(name).map(Some).ok_or(Errno::EINVAL)),
        other => Err(CallError::BadArgs(format!("expected signal, got {other:?}"))),
    }
}

fn pid_arg(term: &Term) -> Result<Pid, CallError> {
    let pid = i32::try_from(int_arg(term)?)
        .map_err(|_| CallError::BadArgs("pid out of range".into()))?;
    Ok(Pid::from_raw(pid))
}

fn cstring(bytes: Vec<u8>) -> Result<CString, Errno> {
    CString::new(bytes).map_err(|_| Errno::EINVAL)
}

pub(super) fn getpid(args: &[Term]) -> Result<CallReply, CallError> {
    expect_args::<0>(args)?;
    Ok(CallReply::term(Term::Int(i64::from(
        nix::unistd::getpid().as_raw(),
    ))))
}

pub(super) fn kill(args: &[Term]) -> Result<CallReply, CallError> {
    let [pid, sig] = expect_args::<2>(args)?;
    let pid = pid_arg(pid)?;
    let sig = match signal_arg(sig)? {
        Ok(sig) => sig,
        Err(errno) => return Ok(errno_reply(errno)),
    };
    Ok(match signal::kill(pid, sig) {
        Ok(()) => CallReply::term(Term::ok()),
        Err(errno) => errno_reply(errno),
    })
}

pub(super) fn sigaction(args: &[Term]) -> Result<CallReply, CallError> {
    let [sig, disposition] = expect_args::<2>(args)?;
    let disposition = atom_arg(disposition)?;
    let Some(disposition) = Disposition::from_atom(disposition) else {
        return Ok(errno_reply(Errno::EINVAL));
    };
    let sig = match signal_arg(sig)? {
        Ok(Some(sig)) => sig,
        Ok(None) | Err(_) => return Ok(errno_reply(Errno::EINVAL)),
    };
    Ok(match set_disposition(sig, disposition) {
        Ok(old) => CallReply::term(Term::ok_with(Term::atom(old.as_atom()))),
        Err(errno) => errno_reply(errno),
    })
}

pub(super) fn exit(args: &[Term]) -> Result<CallReply, CallError> {
    let [status] = expect_args::<1>(args)?;
    let status = i32::try_from(int_arg(status)?)
        .map_err(|_| CallError::BadArgs("exit status out of range".into()))?;
    tracing::info!(status, "Exiting on request");
    std::process::exit(status)
}

pub(super) fn execvp(args: &[Term]) -> Result<CallReply, CallError> {
    let [file, argv] = expect_args::<2>(args)?;
    let file = bytes_arg(file)?;
    let argv = argv
        .as_list()
        .ok_or_else(|| CallError::BadArgs("argv must be a list".into()))?
        .iter()
        .map(bytes_arg)
        .collect::<Result<Vec<_>, _>>()?;

    let file = match cstring(file) {
        Ok(file) => file,
        Err(errno) => return Ok(errno_reply(errno)),
    };
    let argv = match argv.into_iter().map(cstring).collect::<Result<Vec<_>, _>>() {
        Ok(argv) => argv,
        Err(errno) => return Ok(errno_reply(errno)),
    };

    tracing::debug!(file = ?file, argc = argv.len(), "Executing");
    let saved = reset_for_exec();
    let Err(errno) = nix::unistd::execvp(&file, &argv);
    restore(saved);
    Ok(errno_reply(errno))
}

/// Pipes for one child. Child-side ends are plain; parent-side read ends
/// are made non-blocking after the fork.
struct ForkPipes {
    stdin: (OwnedFd, OwnedFd),
    stdout: (OwnedFd, OwnedFd),
    stderr: (OwnedFd, OwnedFd),
    control: (OwnedFd, OwnedFd),
}

impl ForkPipes {
    fn new() -> nix::Result<Self> {
        let pipe = || pipe2(OFlag::O_CLOEXEC);
        Ok(Self {
            stdin: pipe()?,
            stdout: pipe()?,
            stderr: pipe()?,
            control: pipe()?,
        })
    }

    fn into_child(self) -> ForkedStdio {
        ForkedStdio {
            stdin: self.stdin.0,
            stdout: self.stdout.1,
            stderr: self.stderr.1,
            control: self.control.1,
        }
    }

    fn into_parent(self, pid: i32) -> std::io::Result<ChildStdio> {
        for fd in [&self.stdout.0, &self.stderr.0, &self.control.0] {
            set_nonblocking(fd.as_fd())?;
        }
        Ok(ChildStdio {
            pid,
            stdin: self.stdin.1,
            stdout: self.stdout.0,
            stderr: self.stderr.0,
            control: self.control.0,
        })
    }
}

pub(super) fn fork(ctx: &mut CallContext<'_>, args: &[Term]) -> Result<CallReply, CallError> {
    expect_args::<0>(args)?;

    if ctx.config.depth >= ctx.config.max_fork_depth || !ctx.children.has_free_slot() {
        tracing::debug!(
            depth = ctx.config.depth,
            children = ctx.children.len(),
            "Refusing fork"
        );
        return Ok(errno_reply(Errno::EAGAIN));
    }

    let pipes = match ForkPipes::new() {
        Ok(pipes) => pipes,
        Err(errno) => return Ok(errno_reply(errno)),
    };

    // Safety: the supervisor is single-threaded; the child only touches
    // descriptors and its own copy of the loop state.
    match unsafe { nix::unistd::fork() } {
        Err(errno) => Ok(errno_reply(errno)),
        Ok(ForkResult::Child) => Ok(CallReply::Forked(pipes.into_child())),
        Ok(ForkResult::Parent { child }) => {
            let stdio = pipes
                .into_parent(child.as_raw())
                .map_err(|e| CallError::Os(Errno::from_raw(e.raw_os_error().unwrap_or(0))))?;
            if let Err(stdio) = ctx.children.insert(stdio) {
                // Slot was checked above; a child we cannot track must not live.
                let _ = signal::kill(child, Signal::SIGKILL);
                tracing::error!(pid = stdio.pid, "Forked child could not be registered");
                return Err(CallError::Os(Errno::EAGAIN));
            }
            tracing::debug!(pid = child.as_raw(), "Forked child");
            Ok(CallReply::term(Term::ok_with(Term::Int(i64::from(
                child.as_raw(),
            )))))
        }
    }
}

pub(super) fn pid(ctx: &mut CallContext<'_>, args: &[Term]) -> Result<CallReply, CallError> {
    expect_args::<0>(args)?;
    let fd_term = |fd: Option<i32>| Term::Int(i64::from(fd.unwrap_or(-1)));
    let mut entries = Vec::new();
    ctx.children.visit(Filter::Active, |record| {
        entries.push(Term::tuple([
            Term::atom("pid"),
            Term::Int(i64::from(record.pid)),
            fd_term(record.stdin.as_ref().map(AsRawFd::as_raw_fd)),
            fd_term(record.raw_fd(Stream::Stdout)),
            fd_term(record.raw_fd(Stream::Stderr)),
        ]));
        Ok::<_, CallError>(())
    })?;
    Ok(CallReply::term(Term::List(entries)))
}
