//! RP6 remote-control wire protocol.
//!
//! Every logical message travels as one length-prefixed frame:
//!
//! ```text
//! [0..3]   u32 LE  byte count of opcode + payload (never the prefix itself)
//! [4]      u8      opcode
//! [5..]    payload, opcode-specific
//! ```
//!
//! - [`composer`]: builds frames from typed values
//! - [`reassembler`]: rebuilds frames from a byte stream, one per connection
//! - [`dispatcher`]: decodes frames into [`Message`]s and routes them to handlers
//! - [`codec`]: little-endian typed value encoding shared by both directions
//!
//! All multi-byte values on the wire are little-endian.

pub mod codec;
pub mod composer;
pub mod dispatcher;
pub mod message;
pub mod reassembler;

pub use codec::{Blob, DecodeError, LuaArg, PayloadReader, WireEncode};
pub use composer::FrameComposer;
pub use dispatcher::{DispatchError, Handler, MessageDispatcher, Outbox};
pub use message::Message;
pub use reassembler::{CursorState, Discard, DiscardReason, FrameError, FrameReassembler, ReassemblyReport};

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;

/// Size of the frame length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;
/// Largest frame body accepted from a peer: 16 MB
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Message kinds.
///
/// 0x01..=0x15 are "simple" numeric values whose width (byte or word) comes
/// from a [`WidthTable`]; everything else carries structured payload.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Opcode {
    RawSerial = 0x00,
    StateSensors = 0x01,
    MotorDirections = 0x02,
    BaseLeds = 0x03,
    M32Leds = 0x04,
    Battery = 0x05,
    LightLeft = 0x06,
    LightRight = 0x07,
    MotorSpeedLeft = 0x08,
    MotorSpeedRight = 0x09,
    MotorDestSpeedLeft = 0x0A,
    MotorDestSpeedRight = 0x0B,
    MotorDistLeft = 0x0C,
    MotorDistRight = 0x0D,
    MotorDestDistLeft = 0x0E,
    MotorDestDistRight = 0x0F,
    MotorCurrentLeft = 0x10,
    MotorCurrentRight = 0x11,
    AcsPower = 0x12,
    Mic = 0x13,
    LastRc5 = 0x14,
    SharpIr = 0x15,

    Command = 0x20,
    GetScripts = 0x21,
    LuaScripts = 0x22,
    UploadLua = 0x23,
    RunLua = 0x24,
    UploadRunLua = 0x25,
    RunServerLua = 0x26,
    RemoveServerLua = 0x27,
    GetServerLua = 0x28,
    RequestedScript = 0x29,
    ScriptRunning = 0x2A,
    LuaText = 0x2B,
    LuaMsg = 0x2C,
    LuaCommand = 0x2D,
}

impl Opcode {
    pub const ALL: [Opcode; 36] = [
        Opcode::RawSerial, Opcode::StateSensors, Opcode::MotorDirections, Opcode::BaseLeds,
        Opcode::M32Leds, Opcode::Battery, Opcode::LightLeft, Opcode::LightRight,
        Opcode::MotorSpeedLeft, Opcode::MotorSpeedRight, Opcode::MotorDestSpeedLeft,
        Opcode::MotorDestSpeedRight, Opcode::MotorDistLeft, Opcode::MotorDistRight,
        Opcode::MotorDestDistLeft, Opcode::MotorDestDistRight, Opcode::MotorCurrentLeft,
        Opcode::MotorCurrentRight, Opcode::AcsPower, Opcode::Mic, Opcode::LastRc5,
        Opcode::SharpIr, Opcode::Command, Opcode::GetScripts, Opcode::LuaScripts,
        Opcode::UploadLua, Opcode::RunLua, Opcode::UploadRunLua, Opcode::RunServerLua,
        Opcode::RemoveServerLua, Opcode::GetServerLua, Opcode::RequestedScript,
        Opcode::ScriptRunning, Opcode::LuaText, Opcode::LuaMsg, Opcode::LuaCommand,
    ];

    pub fn from_u8(v: u8) -> Option<Opcode> {
        match v {
            0x00..=0x15 | 0x20..=0x2D => Opcode::ALL.iter().copied().find(|op| *op as u8 == v),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Numeric opcodes decoded through the width table.
    pub fn is_simple(self) -> bool {
        (0x01..=0x15).contains(&(self as u8))
    }

    /// Width used by [`WidthTable::standard`]. `None` for structured opcodes.
    pub fn standard_width(self) -> Option<DataWidth> {
        use Opcode::*;
        match self {
            StateSensors | MotorDirections | BaseLeds | M32Leds | MotorSpeedLeft
            | MotorSpeedRight | MotorDestSpeedLeft | MotorDestSpeedRight | AcsPower
            | SharpIr => Some(DataWidth::Byte),
            Battery | LightLeft | LightRight | MotorDistLeft | MotorDistRight
            | MotorDestDistLeft | MotorDestDistRight | MotorCurrentLeft | MotorCurrentRight
            | Mic | LastRc5 => Some(DataWidth::Word),
            _ => None,
        }
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 { op as u8 }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, *self as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataWidth {
    Byte,
    Word,
}

impl DataWidth {
    pub fn len(self) -> usize {
        match self {
            DataWidth::Byte => 1,
            DataWidth::Word => 2,
        }
    }
}

/// Opcode → width map for simple numeric opcodes.
///
/// Owned by a [`MessageDispatcher`]; each protocol instance carries its own.
#[derive(Debug, Clone, Default)]
pub struct WidthTable {
    widths: HashMap<Opcode, DataWidth>,
}

impl WidthTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        let widths = Opcode::ALL
            .iter()
            .filter_map(|op| op.standard_width().map(|w| (*op, w)))
            .collect();
        WidthTable { widths }
    }

    pub fn get(&self, op: Opcode) -> Option<DataWidth> {
        self.widths.get(&op).copied()
    }

    pub fn set(&mut self, op: Opcode, width: DataWidth) {
        self.widths.insert(op, width);
    }

    pub fn remove(&mut self, op: Opcode) -> Option<DataWidth> {
        self.widths.remove(&op)
    }

    pub fn len(&self) -> usize {
        self.widths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widths.is_empty()
    }
}

/// One complete frame body as cut from the stream.
///
/// `opcode` stays a raw byte so unknown opcodes can still be drained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: impl Into<u8>, payload: impl Into<Bytes>) -> Self {
        Frame { opcode: opcode.into(), payload: payload.into() }
    }

    /// Value of the length prefix for this frame.
    pub fn body_len(&self) -> usize {
        1 + self.payload.len()
    }

    /// Wire bytes including the length prefix.
    pub fn encode(&self) -> Bytes {
        let mut c = FrameComposer::new(self.opcode);
        c.put_raw(&self.payload);
        c.finish()
    }
}

/// Per-connection safety limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest accepted value of the length prefix
    pub max_frame_len: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Limits { max_frame_len: DEFAULT_MAX_FRAME_LEN }
    }
}
