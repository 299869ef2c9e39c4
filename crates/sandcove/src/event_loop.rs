//! The supervisor's single-threaded event loop.
//!
//! Each iteration:
//! 1. Resync the child table with the configured capacity; reclaim slots.
//! 2. Collect interest: host input, signal pipe, open child control/stdout/
//!    stderr descriptors.
//! 3. Block in `poll(2)` (retrying EINTR).
//! 4. Host frame: CALL goes to the call table, STDIN to a child.
//! 5. One signal record: SIGCHLD reaps every exited child.
//! 6. Proxy ready child output.
//!
//! Host writes land before child output is read, and a child's pending
//! output is flushed before its exit is reported, so the host never sees
//! data for a pid after that pid's exit event.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use bytes::Bytes;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio_util::codec::Decoder;

use crate::bootstrap::redirect;
use crate::bridge::host::HostChannel;
use crate::bridge::protocol::{HostRequest, MAX_MESSAGE_LEN, MessageType, Outbound, max_payload};
use crate::calls::{CallContext, CallError, CallReply, CallTable, ForkedStdio};
use crate::child::{ChildRecord, ChildTable, ExitState, Filter, Mode, Stream};
use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::signal::{Disposition, SignalBridge, signal_term};
use crate::term::Term;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Host,
    Signals,
    /// Keyed by slot: a pid can briefly name two records.
    Child { slot: usize, stream: Stream },
}

#[derive(Debug, Clone, Copy)]
struct Interest {
    fd: RawFd,
    owner: Owner,
}

enum Step {
    Continue,
    Shutdown,
    Forked(ForkedStdio),
}

/// Outcome of one read from a child descriptor.
enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Eof,
    Failed,
}

fn read_child(record: &ChildRecord, stream: Stream, buf: &mut [u8]) -> ReadOutcome {
    let Some(mut file) = record.stream(stream) else {
        return ReadOutcome::Eof;
    };
    loop {
        return match file.read(buf) {
            Ok(0) => ReadOutcome::Eof,
            Ok(n) => ReadOutcome::Data(n),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
            Err(err) => {
                tracing::debug!(pid = record.pid, ?stream, error = %err, "Child read failed");
                ReadOutcome::Failed
            }
        };
    }
}

/// Sends child output and notifications to the host.
struct Proxy<'a> {
    host: &'a mut HostChannel,
    config: &'a Config,
    buf: &'a mut [u8],
}

impl Proxy<'_> {
    fn budget(&self) -> usize {
        max_payload(self.config.depth, MAX_MESSAGE_LEN).min(self.buf.len())
    }

    /// A notification addressed to `pid` that no child wrote.
    fn notify(&mut self, pid: i32, msg_type: MessageType, term: Term) -> Result<()> {
        self.host
            .send(Outbound::addressed(msg_type, pid, term.encode()))
    }

    fn notify_closed(&mut self, pid: i32, stream: Stream) -> Result<()> {
        let notify = &self.config.notify;
        let name = match stream {
            Stream::Control if notify.fdctl_closed => "fdctl_closed",
            Stream::Stdout if notify.stdout_closed => "stdout_closed",
            Stream::Stderr if notify.stderr_closed => "stderr_closed",
            _ => return Ok(()),
        };
        self.notify(pid, MessageType::Ctl, Term::atom(name))
    }

    /// Reads once from `stream`. Returns false once nothing more is readable
    /// right now (would block, end of stream, or a closed descriptor).
    fn service(&mut self, record: &mut ChildRecord, stream: Stream) -> Result<bool> {
        match stream {
            Stream::Control => self.control(record),
            Stream::Stdout if record.mode == Mode::Supervisor => self.framed_stdout(record),
            Stream::Stdout | Stream::Stderr => self.raw_output(record, stream),
        }
    }

    fn control(&mut self, record: &mut ChildRecord) -> Result<bool> {
        let mut scratch = [0u8; 16];
        match read_child(record, Stream::Control, &mut scratch) {
            // Nothing is ever expected on the channel; only its closing counts.
            ReadOutcome::Data(_) => Ok(true),
            ReadOutcome::WouldBlock => Ok(false),
            ReadOutcome::Failed => {
                record.close(Stream::Control);
                Ok(false)
            }
            ReadOutcome::Eof => {
                record.close(Stream::Control);
                self.executed(record)?;
                Ok(false)
            }
        }
    }

    /// The child exec'd: complete frames it wrote before that still go out
    /// framed, anything after is a raw byte stream.
    fn executed(&mut self, record: &mut ChildRecord) -> Result<()> {
        self.forward_frames(record)?;
        record.mode = Mode::Executed;
        tracing::debug!(pid = record.pid, "Child switched to executed mode");

        let leftover = record.frames.split().freeze();
        let budget = self.budget().max(1);
        for chunk in leftover.chunks(budget) {
            self.host.send(Outbound::proxied(
                MessageType::Stdout,
                record.pid,
                Bytes::copy_from_slice(chunk),
            ))?;
        }

        self.notify_closed(record.pid, Stream::Control)
    }

    fn forward_frames(&mut self, record: &mut ChildRecord) -> Result<()> {
        loop {
            match record.framer.decode(&mut record.frames) {
                Ok(Some(frame)) => {
                    self.host
                        .send(Outbound::proxied(MessageType::Proxy, record.pid, frame))?;
                }
                Ok(None) => return Ok(()),
                Err(err) => {
                    tracing::debug!(pid = record.pid, error = %err, "Bad frame from child");
                    record.frames.clear();
                    record.close(Stream::Stdout);
                    return Ok(());
                }
            }
        }
    }

    fn framed_stdout(&mut self, record: &mut ChildRecord) -> Result<bool> {
        match read_child(record, Stream::Stdout, self.buf) {
            ReadOutcome::Data(n) => {
                record.frames.extend_from_slice(&self.buf[..n]);
                self.forward_frames(record)?;
                Ok(record.stdout.is_some())
            }
            ReadOutcome::WouldBlock => Ok(false),
            ReadOutcome::Failed => {
                record.close(Stream::Stdout);
                Ok(false)
            }
            ReadOutcome::Eof => {
                if !record.frames.is_empty() {
                    tracing::debug!(
                        pid = record.pid,
                        bytes = record.frames.len(),
                        "Dropping partial frame at end of stream"
                    );
                    record.frames.clear();
                }
                self.closed(record, Stream::Stdout)?;
                Ok(false)
            }
        }
    }

    fn raw_output(&mut self, record: &mut ChildRecord, stream: Stream) -> Result<bool> {
        let budget = self.budget().max(1);
        let msg_type = match stream {
            Stream::Stderr => MessageType::Stderr,
            _ => MessageType::Stdout,
        };
        match read_child(record, stream, &mut self.buf[..budget]) {
            ReadOutcome::Data(n) => {
                self.host.send(Outbound::proxied(
                    msg_type,
                    record.pid,
                    Bytes::copy_from_slice(&self.buf[..n]),
                ))?;
                Ok(true)
            }
            ReadOutcome::WouldBlock => Ok(false),
            ReadOutcome::Failed => {
                record.close(stream);
                Ok(false)
            }
            ReadOutcome::Eof => {
                self.closed(record, stream)?;
                Ok(false)
            }
        }
    }

    fn closed(&mut self, record: &mut ChildRecord, stream: Stream) -> Result<()> {
        record.close(stream);
        tracing::trace!(pid = record.pid, ?stream, "Child stream closed");
        self.notify_closed(record.pid, stream)
    }

    /// Everything the child wrote before exiting, then the exit itself.
    fn exited(&mut self, record: &mut ChildRecord, state: ExitState) -> Result<()> {
        for stream in [Stream::Control, Stream::Stdout, Stream::Stderr] {
            while record.stream(stream).is_some() && self.service(record, stream)? {}
        }

        let had_stdin = record.stdin.take().is_some();

        if had_stdin && self.config.notify.stdin_closed {
            self.notify(record.pid, MessageType::Ctl, Term::atom("stdin_closed"))?;
        }

        record.exit = Some(state);
        tracing::debug!(pid = record.pid, ?state, "Child exited");

        match state {
            ExitState::Exited(code) if self.config.notify.exit_status => self.notify(
                record.pid,
                MessageType::Event,
                Term::tuple([Term::atom("exit_status"), Term::Int(i64::from(code))]),
            ),
            ExitState::Signaled(signum) if self.config.notify.termsig => self.notify(
                record.pid,
                MessageType::Event,
                Term::tuple([Term::atom("termsig"), signal_term(signum)]),
            ),
            _ => Ok(()),
        }
    }
}

pub struct EventLoop<C> {
    config: Config,
    calls: C,
    host: HostChannel,
    signals: SignalBridge,
    children: ChildTable,
    /// Write end of this supervisor's own control channel. Close-on-exec, so
    /// the parent sees end of stream once this process execs.
    control: Option<OwnedFd>,
    fd_ceiling: u64,
    interest: Vec<Interest>,
    buf: Vec<u8>,
}

impl<C: CallTable> EventLoop<C> {
    pub fn new(config: Config, calls: C, host: HostChannel, signals: SignalBridge) -> Self {
        let children = ChildTable::new(config.max_children);
        Self {
            config,
            calls,
            host,
            signals,
            children,
            control: None,
            fd_ceiling: 0,
            interest: Vec::new(),
            buf: vec![0; MAX_MESSAGE_LEN],
        }
    }

    pub fn with_control(mut self, control: OwnedFd) -> Self {
        self.control = Some(control);
        self
    }

    /// Tells the host this supervisor is ready.
    pub fn announce(&mut self) -> Result<()> {
        self.host
            .send(Outbound::reply(MessageType::Call, Term::ok().encode()))
    }

    /// Runs until the host closes its end. Returns `Ok` on that clean
    /// shutdown; every `Err` is fatal.
    pub fn run(mut self) -> Result<()> {
        self.announce()?;
        tracing::info!(
            depth = self.config.depth,
            max_children = self.config.max_children,
            "Supervisor ready"
        );

        loop {
            self.sync_limits()?;
            self.collect_interest();
            let ready = self.wait()?;

            let interest = std::mem::take(&mut self.interest);
            let step = self.dispatch(&interest, &ready);
            self.interest = interest;

            match step? {
                Step::Continue => {}
                Step::Shutdown => {
                    tracing::info!("Host closed the channel, exiting");
                    return Ok(());
                }
                Step::Forked(stdio) => self.become_child(stdio)?,
            }
        }
    }

    fn dispatch(&mut self, interest: &[Interest], ready: &[bool]) -> Result<Step> {
        for (entry, _) in interest.iter().zip(ready).filter(|(_, ready)| **ready) {
            match entry.owner {
                Owner::Host => match self.host.read_request()? {
                    None => return Ok(Step::Shutdown),
                    Some(request) => {
                        if let Some(stdio) = self.handle_request(request)? {
                            // Nothing else of the parent's is ours to service.
                            return Ok(Step::Forked(stdio));
                        }
                    }
                },
                Owner::Signals => self.handle_signal()?,
                Owner::Child { slot, stream } => self.service_child(slot, entry.fd, stream)?,
            }
        }
        Ok(Step::Continue)
    }

    fn sync_limits(&mut self) -> Result<()> {
        if self.children.capacity() != self.config.max_children {
            self.children.reset(self.config.max_children)?;
        }

        match config::fd_ceiling() {
            Ok(ceiling) if ceiling != self.fd_ceiling => {
                tracing::debug!(old = self.fd_ceiling, ceiling, "Descriptor ceiling changed");
                self.fd_ceiling = ceiling;
                self.interest.shrink_to(2 + 3 * self.children.len());
            }
            Ok(_) => {}
            Err(errno) => tracing::warn!(%errno, "Could not read descriptor ceiling"),
        }

        self.children.reclaim();
        Ok(())
    }

    fn collect_interest(&mut self) {
        let mut interest = std::mem::take(&mut self.interest);
        interest.clear();
        interest.push(Interest {
            fd: self.host.input_raw_fd(),
            owner: Owner::Host,
        });
        interest.push(Interest {
            fd: self.signals.read_fd().as_raw_fd(),
            owner: Owner::Signals,
        });
        // Visitor never fails.
        let _ = self.children.visit(Filter::Active, |record| {
            for (fd, stream) in record.open_streams() {
                interest.push(Interest {
                    fd,
                    owner: Owner::Child {
                        slot: record.slot,
                        stream,
                    },
                });
            }
            Ok::<_, ()>(())
        });
        self.interest = interest;
    }

    fn wait(&self) -> Result<Vec<bool>> {
        let wanted = PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL;
        let mut fds: Vec<PollFd<'_>> = self
            .interest
            .iter()
            .map(|interest| {
                // Safety: every fd in the interest set is owned by self and
                // stays open until the PollFds are dropped at the end of this
                // function.
                let fd = unsafe { BorrowedFd::borrow_raw(interest.fd) };
                PollFd::new(fd, PollFlags::POLLIN)
            })
            .collect();

        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(Error::Poll(errno)),
            }
        }

        Ok(fds
            .iter()
            .map(|fd| fd.revents().is_some_and(|events| events.intersects(wanted)))
            .collect())
    }

    /// Returns the child-side descriptors if a `fork` call made this process
    /// the child.
    fn handle_request(&mut self, request: HostRequest) -> Result<Option<ForkedStdio>> {
        match request {
            HostRequest::Call { command, args } => {
                let mut ctx = CallContext {
                    config: &mut self.config,
                    children: &mut self.children,
                };
                match self.calls.execute(&mut ctx, command, &args) {
                    Ok(CallReply::Reply(reply)) => {
                        let max = max_payload(self.config.depth, MAX_MESSAGE_LEN);
                        if reply.len() > max {
                            return Err(Error::Call {
                                command,
                                source: CallError::ReplyTooLarge {
                                    len: reply.len(),
                                    max,
                                },
                            });
                        }
                        self.host.send(Outbound::reply(MessageType::Call, reply))?;
                        Ok(None)
                    }
                    Ok(CallReply::Forked(stdio)) => Ok(Some(stdio)),
                    Err(source) => Err(Error::Call { command, source }),
                }
            }
            HostRequest::Stdin { pid, data } => {
                self.write_stdin(pid, &data)?;
                Ok(None)
            }
        }
    }

    fn write_stdin(&mut self, pid: i32, data: &[u8]) -> Result<()> {
        let mut delivered = false;
        if pid > 0 {
            let _ = self.children.visit(Filter::Pid(pid), |record| {
                let Some(stdin) = record.stdin.as_mut() else {
                    return Ok::<_, ()>(());
                };
                delivered = true;
                if let Err(err) = stdin.write_all(data) {
                    tracing::debug!(pid, error = %err, "Child stdin write failed, closing");
                    record.stdin = None;
                }
                Ok(())
            });
        }

        if !delivered {
            tracing::debug!(pid, "Stdin for unknown pid");
            self.host.send(Outbound::addressed(
                MessageType::Ctl,
                pid,
                Term::atom("badpid").encode(),
            ))?;
        }
        Ok(())
    }

    fn handle_signal(&mut self) -> Result<()> {
        let Some(record) = self.signals.read_record()? else {
            return Ok(());
        };

        if record.is_child_exit() {
            return self.reap();
        }

        match record.disposition {
            Disposition::Info => {
                tracing::debug!(signum = record.signum, "Forwarding signal");
                self.host.send(Outbound::reply(
                    MessageType::Event,
                    record.to_event().encode(),
                ))
            }
            _ => Err(Error::desync(format!(
                "unexpected signal record for {}",
                record.signum
            ))),
        }
    }

    /// Collects every exited child, not just one: several may have exited
    /// behind a single SIGCHLD.
    fn reap(&mut self) -> Result<()> {
        loop {
            let (pid, state) = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => (pid, ExitState::Exited(code)),
                Ok(WaitStatus::Signaled(pid, signal, _core)) => {
                    (pid, ExitState::Signaled(signal as i32))
                }
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return Ok(()),
                Ok(other) => {
                    tracing::trace!(?other, "Ignoring wait status");
                    continue;
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(Error::Poll(errno)),
            };
            self.child_exited(pid.as_raw(), state)?;
        }
    }

    fn child_exited(&mut self, pid: i32, state: ExitState) -> Result<()> {
        let mut proxy = Proxy {
            host: &mut self.host,
            config: &self.config,
            buf: &mut self.buf,
        };
        let found = self
            .children
            .visit(Filter::Pid(pid), |record| proxy.exited(record, state))?;
        if found == 0 {
            tracing::debug!(pid, "Reaped a process that is not in the table");
        }
        Ok(())
    }

    fn service_child(&mut self, slot: usize, fd: RawFd, stream: Stream) -> Result<()> {
        let mut proxy = Proxy {
            host: &mut self.host,
            config: &self.config,
            buf: &mut self.buf,
        };
        self.children.visit(Filter::Slot(slot), |record| {
            // The descriptor may have been closed (and its number reused)
            // earlier in this iteration.
            if record.raw_fd(stream) != Some(fd) {
                return Ok(());
            }
            proxy.service(record, stream).map(|_| ())
        })?;
        Ok(())
    }

    /// Turns a freshly forked child into a nested supervisor: stdio is
    /// rewired to the pipes from the parent, and every piece of the parent's
    /// state that is not ours is dropped.
    fn become_child(&mut self, stdio: ForkedStdio) -> Result<()> {
        let ForkedStdio {
            stdin,
            stdout,
            stderr,
            control,
        } = stdio;

        redirect(stdin.as_fd(), self.host.input_raw_fd()).map_err(Error::Bootstrap)?;
        redirect(stdout.as_fd(), self.host.output_raw_fd()).map_err(Error::Bootstrap)?;
        redirect(stderr.as_fd(), libc::STDERR_FILENO).map_err(Error::Bootstrap)?;
        drop((stdin, stdout, stderr));

        // Closes every descriptor inherited for the parent's other children.
        self.children.reset(self.config.max_children)?;

        self.signals = SignalBridge::new().map_err(Error::Bootstrap)?;
        self.signals
            .install_child_handler()
            .map_err(|errno| Error::Bootstrap(errno.into()))?;

        self.control = Some(control);
        self.config.depth += 1;
        tracing::debug!(depth = self.config.depth, "Running as nested supervisor");

        self.announce()
    }
}
