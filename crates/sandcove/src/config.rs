//! Process-wide settings, built once at startup and owned by the event loop.

use nix::sys::resource::{RLIM_INFINITY, Resource, getrlimit, setrlimit};

/// Descriptors 0-5: stdio, signal pipe read/write, control fifo.
pub const RESERVED_FDS: u64 = 6;

/// control, stdin, stdout, stderr
pub const FDS_PER_CHILD: u64 = 4;

pub const DEFAULT_MAX_FORK_DEPTH: u16 = 16;

/// Replacement for an unlimited stack: the usual Linux default.
pub const DEFAULT_STACK_SIZE: u64 = 8 * 1024 * 1024;

/// Which unsolicited notifications the host wants to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notify {
    pub exit_status: bool,
    pub termsig: bool,
    pub fdctl_closed: bool,
    pub stdin_closed: bool,
    pub stdout_closed: bool,
    pub stderr_closed: bool,
}

impl Default for Notify {
    fn default() -> Self {
        Self {
            exit_status: true,
            termsig: true,
            fdctl_closed: true,
            stdin_closed: false,
            stdout_closed: false,
            stderr_closed: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Nesting level of this supervisor; 0 for the one the host launched.
    pub depth: u16,
    pub max_children: usize,
    pub max_fork_depth: u16,
    pub verbose: u8,
    pub notify: Notify,
}

impl Config {
    pub fn new(max_children: usize) -> Self {
        Self {
            depth: 0,
            max_children,
            max_fork_depth: DEFAULT_MAX_FORK_DEPTH,
            verbose: 0,
            notify: Notify::default(),
        }
    }

    pub fn with_depth(mut self, depth: u16) -> Self {
        self.depth = depth;
        self
    }

    /// Reads a host-visible option. `None` for unknown names.
    pub fn get_option(&self, name: &str) -> Option<i64> {
        let flag = |on: bool| i64::from(on);
        Some(match name {
            "exit_status" => flag(self.notify.exit_status),
            "termsig" => flag(self.notify.termsig),
            "fdctl_closed" => flag(self.notify.fdctl_closed),
            "stdin_closed" => flag(self.notify.stdin_closed),
            "stdout_closed" => flag(self.notify.stdout_closed),
            "stderr_closed" => flag(self.notify.stderr_closed),
            "maxchild" => self.max_children as i64,
            "maxforkdepth" => i64::from(self.max_fork_depth),
            "verbose" => i64::from(self.verbose),
            "depth" => i64::from(self.depth),
            _ => return None,
        })
    }

    /// Updates a host-visible option. Returns `false` for unknown or
    /// read-only names and out-of-range values.
    pub fn set_option(&mut self, name: &str, value: i64) -> bool {
        let on = value != 0;
        match name {
            "exit_status" => self.notify.exit_status = on,
            "termsig" => self.notify.termsig = on,
            "fdctl_closed" => self.notify.fdctl_closed = on,
            "stdin_closed" => self.notify.stdin_closed = on,
            "stdout_closed" => self.notify.stdout_closed = on,
            "stderr_closed" => self.notify.stderr_closed = on,
            "maxchild" => match usize::try_from(value) {
                Ok(n) => self.max_children = n,
                Err(_) => return false,
            },
            "maxforkdepth" => match u16::try_from(value) {
                Ok(n) => self.max_fork_depth = n,
                Err(_) => return false,
            },
            "verbose" => match u8::try_from(value) {
                Ok(n) => self.verbose = n,
                Err(_) => return false,
            },
            _ => return false,
        }
        true
    }
}

/// Soft limit on open descriptors.
pub fn fd_ceiling() -> nix::Result<u64> {
    let (soft, _hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
    Ok(soft)
}

/// Number of children that fit under the descriptor ceiling.
pub fn max_children_for(fd_ceiling: u64) -> usize {
    let usable = fd_ceiling.saturating_sub(RESERVED_FDS) / FDS_PER_CHILD;
    usize::try_from(usable).unwrap_or(usize::MAX)
}

/// The stack limit also sizes the stack handed to cloned children, so an
/// unlimited value is replaced with [`DEFAULT_STACK_SIZE`].
pub fn normalize_stack_limit() -> nix::Result<()> {
    let (soft, hard) = getrlimit(Resource::RLIMIT_STACK)?;
    if soft == RLIM_INFINITY {
        tracing::debug!(stack_size = DEFAULT_STACK_SIZE, "Normalizing unlimited stack size");
        setrlimit(Resource::RLIMIT_STACK, DEFAULT_STACK_SIZE, hard)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_defaults() {
        let notify = Notify::default();
        assert!(notify.exit_status && notify.termsig && notify.fdctl_closed);
        assert!(!notify.stdin_closed && !notify.stdout_closed && !notify.stderr_closed);
    }

    #[test]
    fn max_children_from_ceiling() {
        assert_eq!(max_children_for(1024), 254);
        assert_eq!(max_children_for(6), 0);
        assert_eq!(max_children_for(0), 0);
    }

    #[test]
    fn options_roundtrip() {
        let mut config = Config::new(8);
        assert_eq!(config.get_option("stdout_closed"), Some(0));
        assert!(config.set_option("stdout_closed", 1));
        assert_eq!(config.get_option("stdout_closed"), Some(1));

        assert!(config.set_option("maxchild", 3));
        assert_eq!(config.max_children, 3);
        assert!(!config.set_option("maxchild", -1));
        assert_eq!(config.max_children, 3);
    }

    #[test]
    fn depth_is_read_only() {
        let mut config = Config::new(8).with_depth(2);
        assert_eq!(config.get_option("depth"), Some(2));
        assert!(!config.set_option("depth", 0));
        assert_eq!(config.depth, 2);
    }

    #[test]
    fn unknown_option() {
        let mut config = Config::new(8);
        assert_eq!(config.get_option("nope"), None);
        assert!(!config.set_option("nope", 1));
    }

    #[test]
    fn ceiling_is_readable() {
        assert!(fd_ceiling().unwrap() > RESERVED_FDS);
    }
}
