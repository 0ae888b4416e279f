//! Frame construction.
//!
//! A [`FrameComposer`] reserves the 4-byte length prefix, writes the opcode,
//! appends payload values in call order and patches the prefix in
//! [`finish`](FrameComposer::finish). `finish` consumes the composer, so one
//! composer always produces exactly one frame.

use super::codec::WireEncode;
use super::LENGTH_PREFIX_LEN;
use bytes::{BufMut, Bytes, BytesMut};

pub struct FrameComposer {
    buf: BytesMut,
}

impl FrameComposer {
    pub fn new(opcode: impl Into<u8>) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32_le(0);
        buf.put_u8(opcode.into());
        FrameComposer { buf }
    }

    /// Append one value.
    pub fn put<T: WireEncode + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.encode(&mut self.buf);
        self
    }

    /// Builder-style [`put`](Self::put).
    pub fn with<T: WireEncode + ?Sized>(mut self, value: &T) -> Self {
        value.encode(&mut self.buf);
        self
    }

    /// Append bytes without any length prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Body length written so far (opcode + payload).
    pub fn body_len(&self) -> usize {
        self.buf.len() - LENGTH_PREFIX_LEN
    }

    pub fn finish(mut self) -> Bytes {
        let len = self.body_len();
        debug_assert!(len <= u32::MAX as usize, "frame body exceeds u32 length prefix");
        self.buf[..LENGTH_PREFIX_LEN].copy_from_slice(&(len as u32).to_le_bytes());
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Blob, Opcode};

    #[test]
    fn test_battery_word() {
        let frame = FrameComposer::new(Opcode::Battery).with(&742u16).finish();
        assert_eq!(&frame[..], &[0x03, 0x00, 0x00, 0x00, 0x05, 0xE6, 0x02]);
    }

    #[test]
    fn test_opcode_only() {
        let frame = FrameComposer::new(Opcode::GetScripts).finish();
        assert_eq!(&frame[..], &[1, 0, 0, 0, 0x21]);
    }

    #[test]
    fn test_values_in_argument_order() {
        let mut c = FrameComposer::new(Opcode::UploadLua);
        c.put("a.lua").put(&Blob(b"x=1"));
        assert_eq!(c.body_len(), 1 + 4 + 5 + 4 + 3);
        let frame = c.finish();
        assert_eq!(u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]), 17);
        assert_eq!(&frame[5..9], &[5, 0, 0, 0]);
        assert_eq!(&frame[9..14], b"a.lua");
        assert_eq!(&frame[18..], b"x=1");
    }
}
