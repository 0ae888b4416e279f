//! Typed payload values.
//!
//! Encoding goes through [`WireEncode`] into a `BytesMut`; decoding reads
//! from a [`PayloadReader`] that never looks past the frame it was built on.
//!
//! | Type | Encoding |
//! |------|----------|
//! | `bool` | 1 byte, 0 or 1 |
//! | `u8` / `u16` / `u32` | little-endian |
//! | `f64` | IEEE-754, little-endian |
//! | string | `u32` byte length + UTF-8 |
//! | blob | `u32` length + raw bytes |
//! | string list | `u32` count + strings |
//! | Lua argument | `u8` tag (0 bool, 1 float, 2 string) + value |

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

const TAG_BOOL: u8 = 0;
const TAG_FLOAT: u8 = 1;
const TAG_STRING: u8 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload ended early: needed {needed} bytes, {available} left")]
    UnexpectedEnd { needed: usize, available: usize },
    #[error("invalid UTF-8 in string")]
    InvalidUtf8,
    #[error("invalid bool byte 0x{0:02X}")]
    InvalidBool(u8),
    #[error("unknown argument tag {0}")]
    UnknownArgTag(u8),
}

/// A value that can be appended to a frame payload.
pub trait WireEncode {
    fn encode(&self, buf: &mut BytesMut);
}

impl WireEncode for bool {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(*self as u8);
    }
}

impl WireEncode for u8 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(*self);
    }
}

impl WireEncode for u16 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(*self);
    }
}

impl WireEncode for u32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(*self);
    }
}

impl WireEncode for f64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_f64_le(*self);
    }
}

impl WireEncode for str {
    fn encode(&self, buf: &mut BytesMut) {
        Blob(self.as_bytes()).encode(buf);
    }
}

impl WireEncode for String {
    fn encode(&self, buf: &mut BytesMut) {
        self.as_str().encode(buf);
    }
}

impl<T: WireEncode> WireEncode for [T] {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len() as u32);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, buf: &mut BytesMut) {
        self.as_slice().encode(buf);
    }
}

impl<T: WireEncode + ?Sized> WireEncode for &T {
    fn encode(&self, buf: &mut BytesMut) {
        (**self).encode(buf);
    }
}

/// Length-prefixed raw bytes (script bodies).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blob<'a>(pub &'a [u8]);

impl WireEncode for Blob<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.0.len() as u32);
        buf.put_slice(self.0);
    }
}

/// Argument of a named Lua event.
#[derive(Debug, Clone, PartialEq)]
pub enum LuaArg {
    Bool(bool),
    Float(f64),
    Str(String),
}

impl WireEncode for LuaArg {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            LuaArg::Bool(b) => {
                buf.put_u8(TAG_BOOL);
                b.encode(buf);
            }
            LuaArg::Float(f) => {
                buf.put_u8(TAG_FLOAT);
                f.encode(buf);
            }
            LuaArg::Str(s) => {
                buf.put_u8(TAG_STRING);
                s.encode(buf);
            }
        }
    }
}

/// Cursor over one frame's payload.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
    len: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        PayloadReader { data, len: data.len() }
    }

    /// Bytes read so far.
    pub fn consumed(&self) -> usize {
        self.len - self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn ensure(&self, needed: usize) -> Result<(), DecodeError> {
        if self.data.len() < needed {
            return Err(DecodeError::UnexpectedEnd { needed, available: self.data.len() });
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.ensure(n)?;
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        self.ensure(1)?;
        Ok(self.data.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        self.ensure(2)?;
        Ok(self.data.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.ensure(4)?;
        Ok(self.data.get_u32_le())
    }

    pub fn read_f64(&mut self) -> Result<f64, DecodeError> {
        self.ensure(8)?;
        Ok(self.data.get_f64_le())
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(DecodeError::InvalidBool(b)),
        }
    }

    pub fn read_blob(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u32()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    pub fn read_string_list(&mut self) -> Result<Vec<String>, DecodeError> {
        let count = self.read_u32()? as usize;
        // Each string needs at least its 4-byte length; bail out before allocating.
        self.ensure(count.saturating_mul(4))?;
        (0..count).map(|_| self.read_string()).collect()
    }

    pub fn read_lua_arg(&mut self) -> Result<LuaArg, DecodeError> {
        match self.read_u8()? {
            TAG_BOOL => Ok(LuaArg::Bool(self.read_bool()?)),
            TAG_FLOAT => Ok(LuaArg::Float(self.read_f64()?)),
            TAG_STRING => Ok(LuaArg::Str(self.read_string()?)),
            tag => Err(DecodeError::UnknownArgTag(tag)),
        }
    }
}
