//! Signal delivery as readable records.
//!
//! Handlers do one thing: a single `write(2)` of a fixed-size record into a
//! non-blocking pipe. If that write fails (pipe full or closed) the handler
//! closes the write end, so a signal storm degrades into lost signals and,
//! once the pipe is drained, an end-of-stream the event loop treats as fatal.
//!
//! ## Safety contracts
//!
//! 1. The write end lives in [`WRITE_FD`] and nowhere else; whoever swaps it
//!    out owns it and closes it exactly once.
//! 2. Handler bodies only touch the atomic, a stack buffer, `errno`, and
//!    `write`/`close`, all async-signal-safe.
//! 3. Records are smaller than `PIPE_BUF`, so each write is atomic and reads
//!    never see a partial record unless the stream is corrupt.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::unistd::pipe2;

use crate::error::{Error, Result};
use crate::term::Term;

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

const INFO_LEN: usize = std::mem::size_of::<libc::siginfo_t>();

/// `signum:4 | disposition:4 | siginfo`, native endian.
pub const RECORD_LEN: usize = 4 + 4 + INFO_LEN;

/// How a signal is handled, as the host names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Disposition {
    /// `sig_dfl`: the OS default action. For SIGCHLD: bridged, no info.
    Default = 0,
    /// `sig_ign`
    Ignore = 1,
    /// `sig_info`: bridged with the raw siginfo, reported to the host.
    Info = 2,
}

impl Disposition {
    pub fn as_atom(self) -> &'static str {
        match self {
            Self::Default => "sig_dfl",
            Self::Ignore => "sig_ign",
            Self::Info => "sig_info",
        }
    }

    pub fn from_atom(name: &str) -> Option<Self> {
        match name {
            "sig_dfl" => Some(Self::Default),
            "sig_ign" => Some(Self::Ignore),
            "sig_info" => Some(Self::Info),
            _ => None,
        }
    }

    fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::Default),
            1 => Some(Self::Ignore),
            2 => Some(Self::Info),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalRecord {
    pub signum: i32,
    pub disposition: Disposition,
    /// Raw `siginfo_t`; empty unless the disposition is [`Disposition::Info`].
    pub info: Vec<u8>,
}

impl SignalRecord {
    pub fn is_child_exit(&self) -> bool {
        self.signum == libc::SIGCHLD
    }

    /// `{signal, Name, Info}`
    pub fn to_event(&self) -> Term {
        Term::tuple([
            Term::atom("signal"),
            signal_term(self.signum),
            Term::binary(self.info.clone()),
        ])
    }
}

/// Lowercase symbolic name (`sigterm`), or the number if unknown.
pub fn signal_term(signum: i32) -> Term {
    match Signal::try_from(signum) {
        Ok(signal) => Term::atom(signal.as_str().to_ascii_lowercase()),
        Err(_) => Term::Int(i64::from(signum)),
    }
}

/// Accepts `sigterm`, `SIGTERM` or `term`.
pub fn parse_signal(name: &str) -> Option<Signal> {
    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    full.parse().ok()
}

/// Writes one record to the active bridge. Async-signal-safe.
pub(crate) fn forward(signum: i32, disposition: Disposition, info: &[u8]) {
    let saved = Errno::last_raw();

    let fd = WRITE_FD.load(Ordering::Acquire);
    if fd >= 0 {
        let mut record = [0u8; RECORD_LEN];
        record[..4].copy_from_slice(&signum.to_ne_bytes());
        record[4..8].copy_from_slice(&(disposition as u32).to_ne_bytes());
        let n = info.len().min(INFO_LEN);
        record[8..8 + n].copy_from_slice(&info[..n]);

        // Safety: fd is owned by WRITE_FD and the buffer outlives the call.
        let written = unsafe { libc::write(fd, record.as_ptr().cast(), RECORD_LEN) };
        if written != RECORD_LEN as isize
            && WRITE_FD
                .compare_exchange(fd, -1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            // Safety: ownership was taken from WRITE_FD just above.
            unsafe { libc::close(fd) };
        }
    }

    Errno::set_raw(saved);
}

extern "C" fn on_child_signal(signum: libc::c_int, _info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    forward(signum, Disposition::Default, &[]);
}

extern "C" fn on_captured_signal(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let info = if info.is_null() {
        &[][..]
    } else {
        // Safety: the kernel hands the handler a valid siginfo_t.
        unsafe { std::slice::from_raw_parts(info.cast::<u8>(), INFO_LEN) }
    };
    forward(signum, Disposition::Info, info);
}

/// Read side of the signal pipe. The write side is published to the handlers
/// while the bridge is alive.
pub struct SignalBridge {
    read: File,
    write_fd: i32,
}

impl SignalBridge {
    /// Creates a fresh close-on-exec, non-blocking pipe and makes it the
    /// target of the handlers.
    pub fn new() -> io::Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        Ok(Self::from_fds(read, write))
    }

    /// Adopts an existing pipe. Both ends must already be non-blocking.
    pub fn from_fds(read: OwnedFd, write: OwnedFd) -> Self {
        let write_fd = write.into_raw_fd();
        let previous = WRITE_FD.swap(write_fd, Ordering::AcqRel);
        if previous >= 0 && previous != write_fd {
            // Safety: the previous owner's descriptor, inherited across fork.
            unsafe { libc::close(previous) };
        }
        Self {
            read: File::from(read),
            write_fd,
        }
    }

    pub fn read_fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }

    /// False once a failed handler write has closed the write end.
    pub fn is_active(&self) -> bool {
        WRITE_FD.load(Ordering::Acquire) == self.write_fd
    }

    /// Bridges SIGCHLD so exits wake the event loop.
    pub fn install_child_handler(&self) -> nix::Result<()> {
        let action = SigAction::new(
            SigHandler::SigAction(on_child_signal),
            SaFlags::SA_SIGINFO | SaFlags::SA_NOCLDSTOP | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // Safety: the handler is async-signal-safe (see module docs).
        unsafe { sigaction(Signal::SIGCHLD, &action) }?;
        Ok(())
    }

    /// Drains one record. `Ok(None)` if nothing is pending.
    pub fn read_record(&mut self) -> Result<Option<SignalRecord>> {
        let mut buf = [0u8; RECORD_LEN];
        let n = match self.read.read(&mut buf) {
            Ok(n) => n,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(None);
            }
            Err(err) => return Err(Error::desync(format!("signal pipe: {err}"))),
        };

        if n == 0 {
            return Err(Error::desync("signal pipe closed"));
        }
        if n != RECORD_LEN {
            return Err(Error::desync(format!("short signal record: {n} bytes")));
        }

        let signum = i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let tag = u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let disposition = Disposition::from_tag(tag)
            .ok_or_else(|| Error::desync(format!("unknown signal disposition: {tag}")))?;
        let info = match disposition {
            Disposition::Info => buf[8..].to_vec(),
            _ => Vec::new(),
        };

        Ok(Some(SignalRecord {
            signum,
            disposition,
            info,
        }))
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        if WRITE_FD
            .compare_exchange(self.write_fd, -1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Safety: taken from WRITE_FD, so no handler can still use it.
            unsafe { libc::close(self.write_fd) };
        }
    }
}

/// Signals whose disposition can never change.
fn is_reserved(signal: Signal) -> bool {
    matches!(signal, Signal::SIGKILL | Signal::SIGSTOP | Signal::SIGCHLD)
}

fn action_for(disposition: Disposition) -> SigAction {
    match disposition {
        Disposition::Default => {
            SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty())
        }
        Disposition::Ignore => {
            SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty())
        }
        Disposition::Info => SigAction::new(
            SigHandler::SigAction(on_captured_signal),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            SigSet::empty(),
        ),
    }
}

fn disposition_of(action: &SigAction) -> Disposition {
    match action.handler() {
        SigHandler::SigDfl => Disposition::Default,
        SigHandler::SigIgn => Disposition::Ignore,
        _ => Disposition::Info,
    }
}

/// Changes how `signal` is handled, returning the previous disposition.
pub fn set_disposition(signal: Signal, disposition: Disposition) -> nix::Result<Disposition> {
    if is_reserved(signal) {
        return Err(Errno::EINVAL);
    }
    // Safety: on_captured_signal is async-signal-safe.
    let old = unsafe { sigaction(signal, &action_for(disposition)) }?;
    tracing::debug!(
        signal = signal.as_str(),
        disposition = disposition.as_atom(),
        "Changed signal disposition"
    );
    Ok(disposition_of(&old))
}

/// Startup state: everything at its default except SIGPIPE, which stays
/// ignored so broken pipes surface as EPIPE.
pub fn install_defaults() {
    reset_all(Some(Signal::SIGPIPE));
}

/// Before exec: every signal back to its default, SIGPIPE included.
/// Returns what was replaced so a failed exec can put it back.
pub fn reset_for_exec() -> Vec<(Signal, SigAction)> {
    reset_all(None)
}

pub fn restore(saved: Vec<(Signal, SigAction)>) {
    for (signal, action) in saved {
        // Safety: these actions were installed by this module.
        if let Err(errno) = unsafe { sigaction(signal, &action) } {
            tracing::warn!(signal = signal.as_str(), %errno, "Could not restore signal");
        }
    }
}

fn reset_all(ignored: Option<Signal>) -> Vec<(Signal, SigAction)> {
    let mut saved = Vec::new();
    for signal in Signal::iterator() {
        if matches!(signal, Signal::SIGKILL | Signal::SIGSTOP) {
            continue;
        }
        let disposition = if Some(signal) == ignored {
            Disposition::Ignore
        } else {
            Disposition::Default
        };
        // Safety: only SIG_DFL / SIG_IGN are installed here.
        match unsafe { sigaction(signal, &action_for(disposition)) } {
            Ok(old) => saved.push((signal, old)),
            Err(errno) => {
                tracing::debug!(signal = signal.as_str(), %errno, "Could not reset signal")
            }
        }
    }
    saved
}

/// The write end is process-global; bridges in tests must not overlap.
#[cfg(test)]
pub(crate) static BRIDGE_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
