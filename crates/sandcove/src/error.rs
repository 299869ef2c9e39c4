//! Fatal conditions of the supervisor.
//!
//! Everything here terminates the process. Failures on a single child
//! descriptor are not errors at this level: they close that descriptor and
//! the loop carries on.

use std::io;

use nix::errno::Errno;

use crate::calls::CallError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or short frame from the host, or an unexplained short read
    /// on the signal pipe.
    #[error("protocol desync: {0}")]
    Desync(String),

    #[error("host channel: {0}")]
    HostIo(#[source] io::Error),

    #[error("configuration: {0}")]
    Config(String),

    #[error("call {command} failed: {source}")]
    Call {
        command: u16,
        #[source]
        source: CallError,
    },

    #[error("poll: {0}")]
    Poll(#[source] Errno),

    #[error("bootstrap: {0}")]
    Bootstrap(#[source] io::Error),
}

impl Error {
    pub fn desync(msg: impl Into<String>) -> Self {
        Self::Desync(msg.into())
    }

    /// Process exit status for this condition.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Desync(_) => Errno::EPROTO as i32,
            Self::HostIo(err) | Self::Bootstrap(err) => {
                err.raw_os_error().unwrap_or(Errno::EIO as i32)
            }
            Self::Call { source, .. } => source.errno().unwrap_or(Errno::EIO) as i32,
            Self::Poll(errno) => *errno as i32,
            Self::Config(_) => Errno::EIO as i32,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
                Self::Desync(err.to_string())
            }
            _ => Self::HostIo(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(Error::desync("short frame").exit_code(), libc::EPROTO);
        assert_eq!(
            Error::HostIo(io::Error::from_raw_os_error(libc::EPIPE)).exit_code(),
            libc::EPIPE
        );
        assert_eq!(Error::Config("oom".into()).exit_code(), libc::EIO);
        assert_eq!(Error::Poll(Errno::EBADF).exit_code(), libc::EBADF);
        assert_eq!(
            Error::Call {
                command: 12,
                source: CallError::Os(Errno::ENOMEM),
            }
            .exit_code(),
            libc::ENOMEM
        );
        assert_eq!(
            Error::Call {
                command: 99,
                source: CallError::UnknownCommand(99),
            }
            .exit_code(),
            libc::EIO
        );
    }

    #[test]
    fn invalid_data_is_desync() {
        let err = Error::from(io::Error::new(io::ErrorKind::InvalidData, "bad tag"));
        assert!(matches!(err, Error::Desync(_)));
    }
}
