//! Wire protocol types for host-supervisor communication.
//!
//! Every frame on the host pipe is `length:2 | type:2 | payload`, where the
//! big-endian length counts everything after the length field. Two header
//! shapes exist:
//!
//! - **CallHeader**: `len | type | payload`
//! - **ProxyHeader**: `len | type | pid:4 | payload`
//!
//! A supervisor running at nesting depth `d` has its output wrapped in one
//! ProxyHeader per ancestor before it reaches the host, so the payload budget
//! shrinks with depth (see [`max_payload`]).

use bytes::{BufMut, Bytes, BytesMut};

/// Capacity of the host's fixed message buffer: the largest value a 2-byte
/// length field can carry.
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;

pub const LENGTH_FIELD_LEN: usize = 2;

/// `len:2 | type:2`
pub const CALL_HEADER_LEN: usize = 4;

/// `len:2 | type:2 | pid:4`
pub const PROXY_HEADER_LEN: usize = 8;

/// Room reserved at every level for the supervisor's own addressed
/// notifications (ProxyHeader + CallHeader around a term).
pub const FRAME_MARGIN: usize = PROXY_HEADER_LEN + CALL_HEADER_LEN;

/// Largest payload a supervisor at `depth` may produce so that, once wrapped
/// in `depth` ProxyHeaders by its ancestors, it still fits `capacity`.
pub const fn max_payload(depth: u16, capacity: usize) -> usize {
    capacity
        .saturating_sub(depth as usize * PROXY_HEADER_LEN)
        .saturating_sub(FRAME_MARGIN)
}

/// Message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    /// host -> supervisor: `pid:4 | data`
    Stdin = 0,
    /// supervisor -> host: raw child stdout, proxy-addressed
    Stdout = 1,
    /// supervisor -> host: raw child stderr, proxy-addressed
    Stderr = 2,
    /// supervisor -> host: `pid:4 | inner frame`
    Proxy = 3,
    /// both directions: `command:2 | args` in, reply term out
    Call = 4,
    /// supervisor -> host: asynchronous notification term
    Event = 5,
    /// supervisor -> host: control notification term
    Ctl = 6,
}

impl MessageType {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for MessageType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Stdin,
            1 => Self::Stdout,
            2 => Self::Stderr,
            3 => Self::Proxy,
            4 => Self::Call,
            5 => Self::Event,
            6 => Self::Ctl,
            other => return Err(other),
        })
    }
}

/// `len | type | payload`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHeader {
    pub msg_type: MessageType,
    pub payload_len: usize,
}

impl CallHeader {
    pub fn new(msg_type: MessageType, payload_len: usize) -> Self {
        Self {
            msg_type,
            payload_len,
        }
    }

    /// Value of the length field: type + payload.
    pub fn total_len(&self) -> usize {
        CALL_HEADER_LEN - LENGTH_FIELD_LEN + self.payload_len
    }

    /// Writes the header. Returns `None` if the frame would not fit a
    /// 2-byte length.
    pub fn put(&self, dst: &mut BytesMut) -> Option<()> {
        let total = u16::try_from(self.total_len()).ok()?;
        dst.reserve(CALL_HEADER_LEN);
        dst.put_u16(total);
        dst.put_u16(self.msg_type.as_u16());
        Some(())
    }
}

/// `len | type | pid | payload`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub msg_type: MessageType,
    pub pid: i32,
    pub payload_len: usize,
}

impl ProxyHeader {
    pub fn new(msg_type: MessageType, pid: i32, payload_len: usize) -> Self {
        Self {
            msg_type,
            pid,
            payload_len,
        }
    }

    /// Value of the length field: type + pid + payload.
    pub fn total_len(&self) -> usize {
        PROXY_HEADER_LEN - LENGTH_FIELD_LEN + self.payload_len
    }

    pub fn put(&self, dst: &mut BytesMut) -> Option<()> {
        let total = u16::try_from(self.total_len()).ok()?;
        dst.reserve(PROXY_HEADER_LEN);
        dst.put_u16(total);
        dst.put_u16(self.msg_type.as_u16());
        dst.put_i32(self.pid);
        Some(())
    }
}

/// Frames the host sends to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRequest {
    /// Run `command` from the call table with ETF-encoded `args`.
    Call { command: u16, args: Bytes },
    /// Write `data` to the stdin of child `pid`.
    Stdin { pid: i32, data: Bytes },
}

/// Frames the supervisor sends to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// CallHeader-framed payload (call replies, signal events, readiness).
    Reply { msg_type: MessageType, payload: Bytes },
    /// ProxyHeader-framed payload: child output, or a child's own frame
    /// forwarded verbatim (`MessageType::Proxy`).
    Proxied {
        msg_type: MessageType,
        pid: i32,
        payload: Bytes,
    },
    /// A notification addressed to `pid` that no child produced: a CallHeader
    /// frame wrapped in a PROXY ProxyHeader.
    Addressed {
        msg_type: MessageType,
        pid: i32,
        payload: Bytes,
    },
}

impl Outbound {
    pub fn reply(msg_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self::Reply {
            msg_type,
            payload: payload.into(),
        }
    }

    pub fn proxied(msg_type: MessageType, pid: i32, payload: impl Into<Bytes>) -> Self {
        Self::Proxied {
            msg_type,
            pid,
            payload: payload.into(),
        }
    }

    pub fn addressed(msg_type: MessageType, pid: i32, payload: impl Into<Bytes>) -> Self {
        Self::Addressed {
            msg_type,
            pid,
            payload: payload.into(),
        }
    }

    /// Size on the wire, length field included.
    pub fn wire_len(&self) -> usize {
        match self {
            Self::Reply { payload, .. } => CALL_HEADER_LEN + payload.len(),
            Self::Proxied { payload, .. } => PROXY_HEADER_LEN + payload.len(),
            Self::Addressed { payload, .. } => {
                PROXY_HEADER_LEN + CALL_HEADER_LEN + payload.len()
            }
        }
    }
}
