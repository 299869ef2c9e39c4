//! Framed codecs for the host pipe and for supervisor-mode children.
//!
//! Uses LengthDelimitedCodec (2-byte big-endian length) for framing and adds
//! the typed header layer from [`protocol`](super::protocol).

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{
    CallHeader, HostRequest, LENGTH_FIELD_LEN, MAX_MESSAGE_LEN, MessageType, Outbound,
    ProxyHeader,
};

fn length_delimited() -> tokio_util::codec::length_delimited::Builder {
    let mut builder = LengthDelimitedCodec::builder();
    builder
        .length_field_length(LENGTH_FIELD_LEN)
        .max_frame_length(MAX_MESSAGE_LEN);
    builder
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Codec for the host channel: decodes [`HostRequest`], encodes [`Outbound`].
#[derive(Debug)]
pub struct HostCodec {
    inner: LengthDelimitedCodec,
}

impl Default for HostCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl HostCodec {
    pub fn new() -> Self {
        Self {
            inner: length_delimited().new_codec(),
        }
    }
}

impl Decoder for HostCodec {
    type Item = HostRequest;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(mut body) = self.inner.decode(src)? else {
            return Ok(None);
        };

        if body.len() < 2 {
            return Err(invalid("frame shorter than its type tag"));
        }
        let tag = body.get_u16();

        match MessageType::try_from(tag) {
            Ok(MessageType::Call) => {
                // command plus at least one byte of arguments
                if body.len() <= 2 {
                    return Err(invalid("call frame without arguments"));
                }
                let command = body.get_u16();
                Ok(Some(HostRequest::Call {
                    command,
                    args: body.freeze(),
                }))
            }
            Ok(MessageType::Stdin) => {
                if body.len() < 4 {
                    return Err(invalid("stdin frame without pid"));
                }
                let pid = body.get_i32();
                Ok(Some(HostRequest::Stdin {
                    pid,
                    data: body.freeze(),
                }))
            }
            Ok(other) => Err(invalid(format!("unexpected message type from host: {other:?}"))),
            Err(tag) => Err(invalid(format!("unknown message type: {tag}"))),
        }
    }
}

impl Encoder<Outbound> for HostCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire_len = item.wire_len();
        dst.reserve(wire_len);
        let too_large = || invalid(format!("frame of {wire_len} bytes exceeds the length field"));

        match item {
            Outbound::Reply { msg_type, payload } => {
                CallHeader::new(msg_type, payload.len())
                    .put(dst)
                    .ok_or_else(too_large)?;
                dst.put_slice(&payload);
            }
            Outbound::Proxied {
                msg_type,
                pid,
                payload,
            } => {
                ProxyHeader::new(msg_type, pid, payload.len())
                    .put(dst)
                    .ok_or_else(too_large)?;
                dst.put_slice(&payload);
            }
            Outbound::Addressed {
                msg_type,
                pid,
                payload,
            } => {
                let inner = CallHeader::new(msg_type, payload.len());
                // the outer header is the larger of the two, so once it fits
                // the inner one does too
                ProxyHeader::new(MessageType::Proxy, pid, LENGTH_FIELD_LEN + inner.total_len())
                    .put(dst)
                    .ok_or_else(too_large)?;
                inner.put(dst).ok_or_else(too_large)?;
                dst.put_slice(&payload);
            }
        }

        tracing::trace!(frame_len = wire_len, "Encoding frame");
        Ok(())
    }
}

/// Splits a supervisor-mode child's stdout into complete frames, length
/// prefix included, so they can be forwarded verbatim inside PROXY.
///
/// Keeps decode state between calls: use one per child stream.
#[derive(Debug)]
pub struct ChildFrames {
    inner: LengthDelimitedCodec,
}

impl Default for ChildFrames {
    fn default() -> Self {
        Self::new()
    }
}

impl ChildFrames {
    pub fn new() -> Self {
        Self {
            inner: length_delimited()
                .num_skip(0)
                .length_adjustment(LENGTH_FIELD_LEN as isize)
                .new_codec(),
        }
    }
}

impl Decoder for ChildFrames {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.inner.decode(src)?.map(BytesMut::freeze))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn decodes_call() {
        let mut codec = HostCodec::new();
        let mut buf = BytesMut::from(&[0x00, 0x06, 0x00, 0x04, 0x00, 0x0c, 0x83, 0x6a][..]);
        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            req,
            HostRequest::Call {
                command: 12,
                args: Bytes::from_static(&[0x83, 0x6a]),
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_stdin() {
        let mut codec = HostCodec::new();
        let mut buf = BytesMut::from(
            &[0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x10, 0x92, b'h', b'i'][..],
        );
        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            req,
            HostRequest::Stdin {
                pid: 4242,
                data: Bytes::from_static(b"hi"),
            }
        );
    }

    #[test]
    fn waits_for_complete_frame() {
        let mut codec = HostCodec::new();
        let mut buf = BytesMut::from(&[0x00, 0x06, 0x00, 0x04][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_host_directed_types() {
        let mut codec = HostCodec::new();
        let mut buf = BytesMut::from(&[0x00, 0x03, 0x00, 0x05, 0x00][..]);
        assert!(codec.decode(&mut buf).is_err());

        let mut buf = BytesMut::from(&[0x00, 0x02, 0x00, 0x09][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_short_frames() {
        let mut codec = HostCodec::new();
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00][..]);
        assert!(codec.decode(&mut buf).is_err());

        let mut buf = BytesMut::from(&[0x00, 0x04, 0x00, 0x04, 0x00, 0x01][..]);
        assert!(codec.decode(&mut buf).is_err());

        let mut buf = BytesMut::from(&[0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x01][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn encodes_reply() {
        let mut codec = HostCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Outbound::reply(MessageType::Call, Bytes::from_static(&[0x83, 0x77, 0x02, b'o', b'k'])),
                &mut buf,
            )
            .unwrap();
        insta::assert_snapshot!(hex(&buf), @"000700048377026f6b");
    }

    #[test]
    fn encodes_proxied_stdout() {
        let mut codec = HostCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Outbound::proxied(MessageType::Stdout, 4242, &b"abc"[..]), &mut buf)
            .unwrap();
        insta::assert_snapshot!(hex(&buf), @"0009000100001092616263");
    }

    #[test]
    fn encodes_addressed_notification() {
        let mut codec = HostCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Outbound::addressed(MessageType::Ctl, 7, &b"xy"[..]), &mut buf)
            .unwrap();
        // outer: len=12, PROXY, pid 7; inner: len=4, CTL, payload
        assert_eq!(
            &buf[..],
            &[
                0x00, 0x0c, 0x00, 0x03, 0x00, 0x00, 0x00, 0x07, 0x00, 0x04, 0x00, 0x06, b'x',
                b'y'
            ]
        );
    }

    #[test]
    fn encode_rejects_oversized_frame() {
        let mut codec = HostCodec::new();
        let mut buf = BytesMut::new();
        let payload = vec![0u8; MAX_MESSAGE_LEN];
        assert!(
            codec
                .encode(Outbound::reply(MessageType::Call, payload), &mut buf)
                .is_err()
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn proxy_headers_count_toward_the_length_field() {
        let mut codec = HostCodec::new();
        let mut buf = BytesMut::new();

        // a reply of this size fits, but not once a pid is prepended
        let payload = vec![0u8; MAX_MESSAGE_LEN - 2];
        codec
            .encode(Outbound::reply(MessageType::Event, payload.clone()), &mut buf)
            .unwrap();
        assert_eq!(buf.len(), MAX_MESSAGE_LEN + LENGTH_FIELD_LEN);

        buf.clear();
        assert!(
            codec
                .encode(Outbound::proxied(MessageType::Stdout, 1, payload.clone()), &mut buf)
                .is_err()
        );
        assert!(
            codec
                .encode(Outbound::addressed(MessageType::Ctl, 1, payload), &mut buf)
                .is_err()
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn child_frames_keep_length_prefix() {
        let mut frames = ChildFrames::new();
        let mut buf = BytesMut::from(
            &[0x00, 0x03, 0x00, 0x04, 0x61, 0x00, 0x04, 0x00, 0x05, 0x00][..],
        );
        let first = frames.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first[..], &[0x00, 0x03, 0x00, 0x04, 0x61]);
        // second frame is incomplete
        assert!(frames.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], &[0x00, 0x04, 0x00, 0x05, 0x00]);
    }
}
