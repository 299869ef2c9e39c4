//! The call table: what a CALL frame's command id does.
//!
//! The event loop only sees [`CallTable`]. [`SysCalls`] is the table the
//! binary ships with; it covers process management (fork, exec, signals) and
//! a handful of inspection calls, and leaves sandboxing primitives out.
//!
//! Arguments arrive as an encoded list term. Replies are encoded terms. An
//! `Err` from [`CallTable::execute`] is fatal to the supervisor; calls report
//! ordinary OS failures to the host as `{error, Errno}` instead.

use std::os::fd::OwnedFd;

use nix::errno::Errno;

use crate::child::ChildTable;
use crate::config::Config;
use crate::term::{Term, TermError};

mod process;
mod system;

/// State a call may read or change.
pub struct CallContext<'a> {
    pub config: &'a mut Config,
    pub children: &'a mut ChildTable,
}

/// Child-side ends of the pipes created by `fork`.
#[derive(Debug)]
pub struct ForkedStdio {
    pub stdin: OwnedFd,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
    pub control: OwnedFd,
}

#[derive(Debug)]
pub enum CallReply {
    /// Encoded reply term, sent back as a CALL frame.
    Reply(Vec<u8>),
    /// This process is the new child of a `fork`; the caller must turn into
    /// a nested supervisor using these descriptors.
    Forked(ForkedStdio),
}

impl CallReply {
    pub fn term(term: Term) -> Self {
        Self::Reply(term.encode())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("unknown command: {0}")]
    UnknownCommand(u16),

    #[error("undecodable arguments: {0}")]
    Term(#[from] TermError),

    #[error("bad arguments: {0}")]
    BadArgs(String),

    #[error("reply of {len} bytes exceeds the {max} byte budget")]
    ReplyTooLarge { len: usize, max: usize },

    #[error("{0}")]
    Os(#[from] Errno),
}

impl CallError {
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Os(errno) => Some(*errno),
            _ => None,
        }
    }
}

pub trait CallTable {
    fn execute(
        &mut self,
        ctx: &mut CallContext<'_>,
        command: u16,
        args: &[u8],
    ) -> Result<CallReply, CallError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Version,
    Getpid,
    Getcwd,
    Chdir,
    Gethostname,
    Getenv,
    Environ,
    ErrnoId,
    IolistToBin,
    Getopt,
    Setopt,
    Kill,
    Fork,
    Execvp,
    Exit,
    Sigaction,
    Pid,
}

impl TryFrom<u16> for Command {
    type Error = CallError;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        Ok(match id {
            0 => Self::Version,
            1 => Self::Getpid,
            2 => Self::Getcwd,
            3 => Self::Chdir,
            4 => Self::Gethostname,
            5 => Self::Getenv,
            6 => Self::Environ,
            7 => Self::ErrnoId,
            8 => Self::IolistToBin,
            9 => Self::Getopt,
            10 => Self::Setopt,
            11 => Self::Kill,
            12 => Self::Fork,
            13 => Self::Execvp,
            14 => Self::Exit,
            15 => Self::Sigaction,
            16 => Self::Pid,
            other => return Err(CallError::UnknownCommand(other)),
        })
    }
}

/// The reference call table.
#[derive(Debug, Default)]
pub struct SysCalls;

impl CallTable for SysCalls {
    fn execute(
        &mut self,
        ctx: &mut CallContext<'_>,
        command: u16,
        args: &[u8],
    ) -> Result<CallReply, CallError> {
        let command = Command::try_from(command)?;
        let args = Term::decode(args)?;
        let args = args
            .as_list()
            .ok_or_else(|| CallError::BadArgs("arguments must be a list".into()))?;

        tracing::debug!(?command, argc = args.len(), "Executing call");

        match command {
            Command::Version => system::version(args),
            Command::Getpid => process::getpid(args),
            Command::Getcwd => system::getcwd(args),
            Command::Chdir => system::chdir(args),
            Command::Gethostname => system::gethostname(args),
            Command::Getenv => system::getenv(args),
            Command::Environ => system::environ(args),
            Command::ErrnoId => system::errno_id(args),
            Command::IolistToBin => system::iolist_to_bin(args),
            Command::Getopt => system::getopt(ctx, args),
            Command::Setopt => system::setopt(ctx, args),
            Command::Kill => process::kill(args),
            Command::Fork => process::fork(ctx, args),
            Command::Execvp => process::execvp(args),
            Command::Exit => process::exit(args),
            Command::Sigaction => process::sigaction(args),
            Command::Pid => process::pid(ctx, args),
        }
    }
}

/// Host-facing errno name: `eagain`, `enoent`, ...
pub fn errno_atom(errno: Errno) -> String {
    match errno {
        Errno::UnknownErrno => "unknown".to_string(),
        other => format!("{other:?}").to_ascii_lowercase(),
    }
}

/// `{error, Errno}`
pub(crate) fn errno_reply(errno: Errno) -> CallReply {
    CallReply::term(Term::error(errno_atom(errno)))
}

fn expect_args<const N: usize>(args: &[Term]) -> Result<&[Term; N], CallError> {
    args.try_into().map_err(|_| {
        CallError::BadArgs(format!("expected {N} arguments, got {}", args.len()))
    })
}

fn int_arg(term: &Term) -> Result<i64, CallError> {
    term.as_int()
        .ok_or_else(|| CallError::BadArgs(format!("expected integer, got {term:?}")))
}

fn atom_arg(term: &Term) -> Result<&str, CallError> {
    term.as_atom()
        .ok_or_else(|| CallError::BadArgs(format!("expected atom, got {term:?}")))
}

/// Binary, string or iolist, flattened.
fn bytes_arg(term: &Term) -> Result<Vec<u8>, CallError> {
    term.to_iodata()
        .ok_or_else(|| CallError::BadArgs(format!("expected iodata, got {term:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: Vec<Term>) -> Vec<u8> {
        Term::List(items).encode()
    }

    fn call(command: u16, args: Vec<Term>) -> Result<Term, CallError> {
        let mut config = Config::new(4);
        let mut children = ChildTable::new(4);
        let mut ctx = CallContext {
            config: &mut config,
            children: &mut children,
        };
        match SysCalls.execute(&mut ctx, command, &list(args))? {
            CallReply::Reply(bytes) => Ok(Term::decode(&bytes).unwrap()),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn errno_atoms() {
        assert_eq!(errno_atom(Errno::EAGAIN), "eagain");
        assert_eq!(errno_atom(Errno::ENOENT), "enoent");
        assert_eq!(errno_atom(Errno::UnknownErrno), "unknown");
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert!(matches!(
            call(200, vec![]),
            Err(CallError::UnknownCommand(200))
        ));
    }

    #[test]
    fn arguments_must_be_a_list() {
        let mut config = Config::new(4);
        let mut children = ChildTable::new(4);
        let mut ctx = CallContext {
            config: &mut config,
            children: &mut children,
        };
        let err = SysCalls
            .execute(&mut ctx, 1, &Term::Int(1).encode())
            .unwrap_err();
        assert!(matches!(err, CallError::BadArgs(_)));

        let err = SysCalls.execute(&mut ctx, 1, &[131]).unwrap_err();
        assert!(matches!(err, CallError::Term(TermError::Truncated)));
    }

    #[test]
    fn wrong_arity_is_an_error() {
        assert!(matches!(
            call(1, vec![Term::Int(1)]),
            Err(CallError::BadArgs(_))
        ));
    }

    #[test]
    fn getpid_matches_process() {
        assert_eq!(
            call(1, vec![]).unwrap(),
            Term::Int(i64::from(std::process::id()))
        );
    }

    #[test]
    fn command_ids() {
        assert_eq!(Command::try_from(12).unwrap(), Command::Fork);
        assert_eq!(Command::try_from(16).unwrap(), Command::Pid);
        assert!(Command::try_from(17).is_err());
    }
}
