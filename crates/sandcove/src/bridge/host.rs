//! Frame I/O on the host descriptors.
//!
//! Reads are exact: the 2-byte length first, then precisely that many bytes,
//! so nothing past the current frame is ever consumed from the pipe. A forked
//! child inherits the descriptors and must not find part of its parent's
//! next frame missing.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::codec::HostCodec;
use super::protocol::{HostRequest, LENGTH_FIELD_LEN, Outbound};
use crate::error::{Error, Result};

pub struct HostChannel {
    input: File,
    output: File,
    codec: HostCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl HostChannel {
    pub fn new(input: OwnedFd, output: OwnedFd) -> Self {
        Self {
            input: File::from(input),
            output: File::from(output),
            codec: HostCodec::new(),
            read_buf: BytesMut::with_capacity(LENGTH_FIELD_LEN),
            write_buf: BytesMut::new(),
        }
    }

    /// Takes ownership of the process's stdin and stdout.
    pub fn stdio() -> Self {
        // Safety: fds 0 and 1 are open for the life of the process and nothing
        // else in the supervisor reads or writes them.
        let (input, output) = unsafe { (OwnedFd::from_raw_fd(0), OwnedFd::from_raw_fd(1)) };
        Self::new(input, output)
    }

    pub fn input_raw_fd(&self) -> RawFd {
        self.input.as_raw_fd()
    }

    pub fn output_raw_fd(&self) -> RawFd {
        self.output.as_raw_fd()
    }

    /// Reads one frame. `Ok(None)` on a clean end of stream between frames.
    pub fn read_request(&mut self) -> Result<Option<HostRequest>> {
        self.read_buf.clear();
        self.read_buf.resize(LENGTH_FIELD_LEN, 0);

        match read_full(&mut self.input, &mut self.read_buf[..]).map_err(Error::HostIo)? {
            0 => return Ok(None),
            LENGTH_FIELD_LEN => {}
            _ => return Err(Error::desync("host closed inside a length field")),
        }

        let len = usize::from(u16::from_be_bytes([self.read_buf[0], self.read_buf[1]]));
        self.read_buf.resize(LENGTH_FIELD_LEN + len, 0);
        self.input
            .read_exact(&mut self.read_buf[LENGTH_FIELD_LEN..])
            .map_err(|err| match err.kind() {
                io::ErrorKind::UnexpectedEof => Error::desync("host closed inside a frame"),
                _ => Error::HostIo(err),
            })?;

        tracing::trace!(frame_len = len, "Read host frame");

        match self.codec.decode(&mut self.read_buf)? {
            Some(request) => Ok(Some(request)),
            None => Err(Error::desync("incomplete host frame")),
        }
    }

    /// Writes one frame in a single `write_all`.
    pub fn send(&mut self, item: Outbound) -> Result<()> {
        self.write_buf.clear();
        self.codec.encode(item, &mut self.write_buf)?;
        self.output
            .write_all(&self.write_buf)
            .map_err(Error::HostIo)
    }
}

/// Like `read_exact`, but reports how much was read before end of stream.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::MessageType;
    use bytes::Bytes;
    use nix::unistd::pipe;

    fn channel() -> (HostChannel, File, File) {
        let (in_read, in_write) = pipe().unwrap();
        let (out_read, out_write) = pipe().unwrap();
        (
            HostChannel::new(in_read, out_write),
            File::from(in_write),
            File::from(out_read),
        )
    }

    #[test]
    fn reads_one_frame_at_a_time() {
        let (mut host, mut to_sup, _from_sup) = channel();
        to_sup
            .write_all(&[0, 6, 0, 4, 0, 1, 0x83, 0x6a, 0, 6, 0, 4, 0, 2, 0x83, 0x6a])
            .unwrap();

        let first = host.read_request().unwrap().unwrap();
        assert!(matches!(first, HostRequest::Call { command: 1, .. }));
        let second = host.read_request().unwrap().unwrap();
        assert!(matches!(second, HostRequest::Call { command: 2, .. }));
    }

    #[test]
    fn clean_eof_between_frames() {
        let (mut host, to_sup, _from_sup) = channel();
        drop(to_sup);
        assert!(host.read_request().unwrap().is_none());
    }

    #[test]
    fn eof_inside_frame_is_desync() {
        let (mut host, mut to_sup, _from_sup) = channel();
        to_sup.write_all(&[0, 8, 0, 0]).unwrap();
        drop(to_sup);
        let err = host.read_request().unwrap_err();
        assert!(matches!(err, Error::Desync(_)), "{err:?}");
    }

    #[test]
    fn eof_inside_length_is_desync() {
        let (mut host, mut to_sup, _from_sup) = channel();
        to_sup.write_all(&[0]).unwrap();
        drop(to_sup);
        assert!(matches!(host.read_request(), Err(Error::Desync(_))));
    }

    #[test]
    fn unexpected_type_is_desync() {
        let (mut host, mut to_sup, _from_sup) = channel();
        to_sup.write_all(&[0, 3, 0, 5, 0]).unwrap();
        assert!(matches!(host.read_request(), Err(Error::Desync(_))));
    }

    #[test]
    fn sends_whole_frames() {
        let (mut host, _to_sup, mut from_sup) = channel();
        host.send(Outbound::proxied(
            MessageType::Stderr,
            3,
            Bytes::from_static(b"oops"),
        ))
        .unwrap();

        let mut buf = [0u8; 12];
        from_sup.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0, 10, 0, 2, 0, 0, 0, 3, b'o', b'o', b'p', b's']);
    }

    #[test]
    fn closed_host_is_fatal() {
        let (mut host, _to_sup, from_sup) = channel();
        drop(from_sup);
        let err = host
            .send(Outbound::reply(MessageType::Call, vec![131, 106]))
            .unwrap_err();
        assert_eq!(err.exit_code(), libc::EPIPE);
    }
}
