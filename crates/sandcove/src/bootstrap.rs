//! Descriptor layout for a supervisor launched directly by the host.
//!
//! Fixed descriptors:
//!
//! | fd | use |
//! |----|-----|
//! | 0, 1 | host channel |
//! | 2 | diagnostics |
//! | 3, 4 | signal pipe read / write |
//! | 5 | control fifo, held open read-write |
//!
//! Whatever already occupies 3-5 (a debugger's log file, an inherited
//! descriptor) is moved above [`MOVE_ABOVE`] first.
//!
//! ## Safety contracts
//!
//! All `unsafe` blocks in this module rely on these guarantees:
//! 1. Called once, before the event loop and before any child exists.
//! 2. A target descriptor is free (moved aside) before it is adopted with
//!    `OwnedFd::from_raw_fd` and overwritten by `dup2`.
//! 3. Each adopted descriptor ends up owned by exactly one `OwnedFd`.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::{dup2, mkfifo, pipe2};

use crate::signal::SignalBridge;

pub const SIGNAL_READ_FD: RawFd = 3;
pub const SIGNAL_WRITE_FD: RawFd = 4;
pub const CONTROL_FD: RawFd = 5;

/// Lowest descriptor an evicted occupant of 3-5 is moved to.
const MOVE_ABOVE: RawFd = 8;

pub struct Reserved {
    pub signals: SignalBridge,
    /// Kept open so the host's read end of the fifo never sees EOF while
    /// this supervisor lives.
    pub control: OwnedFd,
}

fn last_os_error<T>(ret: libc::c_int, value: T) -> io::Result<T> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(value)
    }
}

pub fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // Safety: fcntl on a borrowed, open descriptor.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    let flags = last_os_error(flags, flags)?;
    // Safety: as above.
    let ret = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    last_os_error(ret, ())
}

fn set_cloexec(fd: BorrowedFd<'_>) -> io::Result<()> {
    // Safety: fcntl on a borrowed, open descriptor.
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
    last_os_error(ret, ())
}

/// Moves whatever occupies `fd` to the first free descriptor at or above
/// [`MOVE_ABOVE`], keeping its close-on-exec flag. Leaves the moved copy
/// open: it belonged to someone else.
fn move_aside(fd: RawFd) -> io::Result<()> {
    // Safety: F_GETFD only probes whether fd is open.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Ok(());
    }

    let cmd = if flags & libc::FD_CLOEXEC != 0 {
        libc::F_DUPFD_CLOEXEC
    } else {
        libc::F_DUPFD
    };
    // Safety: duplicating an open descriptor to a fresh number.
    let moved = unsafe { libc::fcntl(fd, cmd, MOVE_ABOVE) };
    let moved = last_os_error(moved, moved)?;
    // Safety: fd is open (checked above) and its duplicate lives on at `moved`.
    let ret = unsafe { libc::close(fd) };
    last_os_error(ret, ())?;

    tracing::debug!(fd, moved, "Moved inherited descriptor out of the reserved range");
    Ok(())
}

/// Makes `target` refer to the same open file as `fd`, close-on-exec.
fn place(fd: OwnedFd, target: RawFd) -> io::Result<OwnedFd> {
    if fd.as_raw_fd() == target {
        return Ok(fd);
    }
    // Safety: target was freed by move_aside; the OwnedFd becomes its only owner.
    let mut placed = unsafe { OwnedFd::from_raw_fd(target) };
    if let Err(errno) = dup2(&fd, &mut placed) {
        // Not ours after all: don't close whatever is there.
        std::mem::forget(placed);
        return Err(io::Error::other(format!("dup2 onto {target} failed: {errno}")));
    }
    set_cloexec(placed.as_fd())?;
    Ok(placed)
}

/// Points `target` at the same open file as `src`, leaving `target`'s
/// current owner in charge of it. Used by a forked child to swap its stdio
/// for the pipes to its parent supervisor.
pub fn redirect(src: BorrowedFd<'_>, target: RawFd) -> io::Result<()> {
    // Safety: target is open and owned elsewhere; forget below keeps this
    // temporary handle from closing it.
    let mut target_fd = unsafe { OwnedFd::from_raw_fd(target) };
    let result = dup2(src, &mut target_fd);
    std::mem::forget(target_fd); // Don't close, the owner still uses it
    result.map_err(|errno| io::Error::other(format!("dup2 onto {target} failed: {errno}")))
}

/// Lays out descriptors 3-5 and creates the control fifo at `fifo`.
pub fn reserve_descriptors(fifo: &Path) -> io::Result<Reserved> {
    for fd in [SIGNAL_READ_FD, SIGNAL_WRITE_FD, CONTROL_FD] {
        move_aside(fd)?;
    }

    let (read, write) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
    tracing::trace!(
        read = read.as_raw_fd(),
        write = write.as_raw_fd(),
        "Created signal pipe"
    );
    // pipe2 hands out the lowest free numbers, which are 3 and 4 here.
    let read = place(read, SIGNAL_READ_FD)?;
    let write = place(write, SIGNAL_WRITE_FD)?;
    let signals = SignalBridge::from_fds(read, write);

    mkfifo(fifo, Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH)
        .map_err(|errno| io::Error::other(format!("mkfifo {}: {errno}", fifo.display())))?;

    // Read-write so the open neither blocks for a reader nor fails with ENXIO.
    let control = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(fifo)?;
    let control = place(OwnedFd::from(control), CONTROL_FD)?;

    tracing::debug!(fifo = %fifo.display(), "Reserved descriptors in place");
    Ok(Reserved { signals, control })
}
