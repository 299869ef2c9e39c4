//! Drives the compiled supervisor over its stdin/stdout.

#![allow(dead_code)]

use std::ffi::OsStr;
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

use sandcove::Term;
use tempfile::TempDir;

pub const STDIN: u16 = 0;
pub const STDOUT: u16 = 1;
pub const STDERR: u16 = 2;
pub const PROXY: u16 = 3;
pub const CALL: u16 = 4;
pub const EVENT: u16 = 5;
pub const CTL: u16 = 6;

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: u16,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn term(&self) -> Term {
        Term::decode(&self.body).expect("frame body is not a term")
    }

    /// Pid and payload of a STDOUT/STDERR/PROXY frame.
    pub fn proxied(&self) -> (i32, &[u8]) {
        let pid = i32::from_be_bytes(self.body[..4].try_into().unwrap());
        (pid, &self.body[4..])
    }

    /// The frame a child (or a notification about it) wrapped in PROXY.
    pub fn inner(&self) -> (i32, Frame) {
        assert_eq!(self.msg_type, PROXY, "not a proxied frame: {self:?}");
        let (pid, payload) = self.proxied();
        let len = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
        assert_eq!(len + 2, payload.len());
        let inner = Frame {
            msg_type: u16::from_be_bytes([payload[2], payload[3]]),
            body: payload[4..].to_vec(),
        };
        (pid, inner)
    }
}

pub fn frame(msg_type: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&u16::try_from(2 + body.len()).unwrap().to_be_bytes());
    out.extend_from_slice(&msg_type.to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub fn call_frame(command: u16, args: Vec<Term>) -> Vec<u8> {
    let mut body = command.to_be_bytes().to_vec();
    body.extend_from_slice(&Term::List(args).encode());
    frame(CALL, &body)
}

pub fn stdin_frame(pid: i32, data: &[u8]) -> Vec<u8> {
    let mut body = pid.to_be_bytes().to_vec();
    body.extend_from_slice(data);
    frame(STDIN, &body)
}

pub struct Host {
    process: Child,
    stdin: Option<ChildStdin>,
    frames: Receiver<Frame>,
    _dir: TempDir,
}

impl Host {
    /// Starts a top-level supervisor with a fresh control fifo.
    pub fn spawn() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("ctl");
        Self::spawn_with(dir, &[OsStr::new("-c"), fifo.as_os_str()])
    }

    pub fn spawn_with(dir: TempDir, args: &[&OsStr]) -> Self {
        let mut process = Command::new(env!("CARGO_BIN_EXE_sandcove"))
            .args(args)
            .env_remove("RUST_LOG")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .expect("failed to start sandcove");

        let mut stdout = process.stdout.take().unwrap();
        let (tx, frames) = mpsc::channel();
        thread::spawn(move || {
            loop {
                let mut len = [0u8; 2];
                if stdout.read_exact(&mut len).is_err() {
                    return;
                }
                let mut rest = vec![0u8; usize::from(u16::from_be_bytes(len))];
                if stdout.read_exact(&mut rest).is_err() {
                    return;
                }
                let frame = Frame {
                    msg_type: u16::from_be_bytes([rest[0], rest[1]]),
                    body: rest[2..].to_vec(),
                };
                if tx.send(frame).is_err() {
                    return;
                }
            }
        });

        Self {
            stdin: process.stdin.take(),
            process,
            frames,
            _dir: dir,
        }
    }

    pub fn send(&mut self, bytes: &[u8]) {
        let stdin = self.stdin.as_mut().expect("host input already closed");
        stdin.write_all(bytes).unwrap();
        stdin.flush().unwrap();
    }

    pub fn call(&mut self, command: u16, args: Vec<Term>) -> Term {
        self.send(&call_frame(command, args));
        let reply = self.next();
        assert_eq!(reply.msg_type, CALL, "expected a call reply: {reply:?}");
        reply.term()
    }

    pub fn next(&self) -> Frame {
        self.frames
            .recv_timeout(TIMEOUT)
            .expect("timed out waiting for a frame")
    }

    /// Reads frames until `done` accepts one. Returns everything read.
    pub fn until(&self, mut done: impl FnMut(&Frame) -> bool) -> Vec<Frame> {
        let mut seen = Vec::new();
        loop {
            let frame = self.next();
            let stop = done(&frame);
            seen.push(frame);
            if stop {
                return seen;
            }
        }
    }

    /// Closes the host channel and waits for the supervisor to exit.
    pub fn finish(mut self) -> ExitStatus {
        drop(self.stdin.take());
        self.process.wait().unwrap()
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        if self.stdin.is_some() {
            let _ = self.process.kill();
            let _ = self.process.wait();
        }
    }
}
