//! Structured values carried inside CALL, EVENT and CTL payloads.
//!
//! The host speaks the Erlang external term format (version 131). Only the
//! subset the supervisor needs is supported: integers, atoms, binaries,
//! proper lists and tuples.

use bytes::{Buf, BufMut};

const VERSION: u8 = 131;

const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const ATOM_EXT: u8 = 100;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const SMALL_ATOM_EXT: u8 = 115;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TermError {
    #[error("unsupported term version: {0}")]
    Version(u8),

    #[error("unsupported term tag: {0}")]
    Tag(u8),

    #[error("term truncated")]
    Truncated,

    #[error("integer out of range")]
    IntegerRange,

    #[error("atom is not valid utf-8")]
    AtomEncoding,

    #[error("improper lists are not supported")]
    ImproperList,

    #[error("{0} trailing bytes after term")]
    Trailing(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Int(i64),
    Atom(String),
    Binary(Vec<u8>),
    List(Vec<Term>),
    Tuple(Vec<Term>),
}

impl Term {
    pub fn atom(name: impl Into<String>) -> Self {
        Self::Atom(name.into())
    }

    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Binary(bytes.into())
    }

    pub fn tuple(elements: impl Into<Vec<Term>>) -> Self {
        Self::Tuple(elements.into())
    }

    pub fn ok() -> Self {
        Self::atom("ok")
    }

    /// `{ok, Value}`
    pub fn ok_with(value: Term) -> Self {
        Self::tuple([Self::ok(), value])
    }

    /// `{error, Reason}`
    pub fn error(reason: impl Into<String>) -> Self {
        Self::tuple([Self::atom("error"), Self::atom(reason)])
    }

    pub fn boolean(value: bool) -> Self {
        Self::atom(if value { "true" } else { "false" })
    }

    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Self::Atom(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Term]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Flattens an iolist (binaries, byte-sized integers and nested lists)
    /// into bytes.
    pub fn to_iodata(&self) -> Option<Vec<u8>> {
        fn walk(term: &Term, out: &mut Vec<u8>) -> Option<()> {
            match term {
                Term::Binary(bytes) => out.extend_from_slice(bytes),
                Term::Int(n) => out.push(u8::try_from(*n).ok()?),
                Term::List(items) => {
                    for item in items {
                        walk(item, out)?;
                    }
                }
                Term::Atom(_) | Term::Tuple(_) => return None,
            }
            Some(())
        }

        let mut out = Vec::new();
        walk(self, &mut out)?;
        Some(out)
    }

    /// Encodes with the leading version byte.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.put_u8(VERSION);
        self.encode_body(&mut buf);
        buf
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Int(n) => encode_int(*n, buf),
            Self::Atom(name) => {
                let bytes = name.as_bytes();
                match u8::try_from(bytes.len()) {
                    Ok(len) => {
                        buf.put_u8(SMALL_ATOM_UTF8_EXT);
                        buf.put_u8(len);
                    }
                    Err(_) => {
                        buf.put_u8(ATOM_UTF8_EXT);
                        buf.put_u16(bytes.len() as u16);
                    }
                }
                buf.put_slice(bytes);
            }
            Self::Binary(bytes) => {
                buf.put_u8(BINARY_EXT);
                buf.put_u32(bytes.len() as u32);
                buf.put_slice(bytes);
            }
            Self::List(items) if items.is_empty() => buf.put_u8(NIL_EXT),
            Self::List(items) => {
                buf.put_u8(LIST_EXT);
                buf.put_u32(items.len() as u32);
                for item in items {
                    item.encode_body(buf);
                }
                buf.put_u8(NIL_EXT);
            }
            Self::Tuple(items) => {
                match u8::try_from(items.len()) {
                    Ok(arity) => {
                        buf.put_u8(SMALL_TUPLE_EXT);
                        buf.put_u8(arity);
                    }
                    Err(_) => {
                        buf.put_u8(LARGE_TUPLE_EXT);
                        buf.put_u32(items.len() as u32);
                    }
                }
                for item in items {
                    item.encode_body(buf);
                }
            }
        }
    }

    /// Decodes a complete, versioned term.
    pub fn decode(mut src: &[u8]) -> Result<Self, TermError> {
        let version = take_u8(&mut src)?;
        if version != VERSION {
            return Err(TermError::Version(version));
        }
        let term = decode_body(&mut src)?;
        if !src.is_empty() {
            return Err(TermError::Trailing(src.len()));
        }
        Ok(term)
    }
}

fn encode_int(n: i64, buf: &mut Vec<u8>) {
    if let Ok(small) = u8::try_from(n) {
        buf.put_u8(SMALL_INTEGER_EXT);
        buf.put_u8(small);
    } else if let Ok(int) = i32::try_from(n) {
        buf.put_u8(INTEGER_EXT);
        buf.put_i32(int);
    } else {
        let mut magnitude = n.unsigned_abs();
        let mut digits = Vec::with_capacity(8);
        while magnitude > 0 {
            digits.push((magnitude & 0xff) as u8);
            magnitude >>= 8;
        }
        buf.put_u8(SMALL_BIG_EXT);
        buf.put_u8(digits.len() as u8);
        buf.put_u8(u8::from(n < 0));
        buf.put_slice(&digits);
    }
}

fn take_u8(src: &mut &[u8]) -> Result<u8, TermError> {
    if src.remaining() < 1 {
        return Err(TermError::Truncated);
    }
    Ok(src.get_u8())
}

fn take_u16(src: &mut &[u8]) -> Result<u16, TermError> {
    if src.remaining() < 2 {
        return Err(TermError::Truncated);
    }
    Ok(src.get_u16())
}

fn take_u32(src: &mut &[u8]) -> Result<u32, TermError> {
    if src.remaining() < 4 {
        return Err(TermError::Truncated);
    }
    Ok(src.get_u32())
}

fn take_bytes<'a>(src: &mut &'a [u8], len: usize) -> Result<&'a [u8], TermError> {
    if src.len() < len {
        return Err(TermError::Truncated);
    }
    let (head, tail) = src.split_at(len);
    *src = tail;
    Ok(head)
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn utf8(bytes: &[u8]) -> Result<String, TermError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| TermError::AtomEncoding)
}

fn decode_body(src: &mut &[u8]) -> Result<Term, TermError> {
    let tag = take_u8(src)?;
    match tag {
        SMALL_INTEGER_EXT => Ok(Term::Int(i64::from(take_u8(src)?))),
        INTEGER_EXT => Ok(Term::Int(i64::from(take_u32(src)? as i32))),
        SMALL_BIG_EXT => {
            let len = usize::from(take_u8(src)?);
            let sign = take_u8(src)?;
            let digits = take_bytes(src, len)?;
            if len > 8 {
                return Err(TermError::IntegerRange);
            }
            let magnitude = digits
                .iter()
                .rev()
                .fold(0u64, |acc, &d| (acc << 8) | u64::from(d));
            let value = if sign == 0 {
                i64::try_from(magnitude).map_err(|_| TermError::IntegerRange)?
            } else {
                0i64.checked_sub_unsigned(magnitude)
                    .ok_or(TermError::IntegerRange)?
            };
            Ok(Term::Int(value))
        }
        ATOM_EXT => {
            let len = usize::from(take_u16(src)?);
            Ok(Term::Atom(latin1(take_bytes(src, len)?)))
        }
        SMALL_ATOM_EXT => {
            let len = usize::from(take_u8(src)?);
            Ok(Term::Atom(latin1(take_bytes(src, len)?)))
        }
        ATOM_UTF8_EXT => {
            let len = usize::from(take_u16(src)?);
            Ok(Term::Atom(utf8(take_bytes(src, len)?)?))
        }
        SMALL_ATOM_UTF8_EXT => {
            let len = usize::from(take_u8(src)?);
            Ok(Term::Atom(utf8(take_bytes(src, len)?)?))
        }
        BINARY_EXT => {
            let len = take_u32(src)? as usize;
            Ok(Term::Binary(take_bytes(src, len)?.to_vec()))
        }
        NIL_EXT => Ok(Term::List(Vec::new())),
        STRING_EXT => {
            let len = usize::from(take_u16(src)?);
            let chars = take_bytes(src, len)?;
            Ok(Term::List(
                chars.iter().map(|&c| Term::Int(i64::from(c))).collect(),
            ))
        }
        LIST_EXT => {
            let len = take_u32(src)? as usize;
            // every element takes at least one byte
            if len > src.len() {
                return Err(TermError::Truncated);
            }
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(decode_body(src)?);
            }
            match decode_body(src)? {
                Term::List(tail) if tail.is_empty() => Ok(Term::List(items)),
                _ => Err(TermError::ImproperList),
            }
        }
        SMALL_TUPLE_EXT | LARGE_TUPLE_EXT => {
            let arity = if tag == SMALL_TUPLE_EXT {
                usize::from(take_u8(src)?)
            } else {
                take_u32(src)? as usize
            };
            if arity > src.len() {
                return Err(TermError::Truncated);
            }
            let mut items = Vec::with_capacity(arity);
            for _ in 0..arity {
                items.push(decode_body(src)?);
            }
            Ok(Term::Tuple(items))
        }
        other => Err(TermError::Tag(other)),
    }
}
