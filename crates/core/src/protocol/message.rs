//! Decoded protocol messages.

use super::codec::{Blob, LuaArg, PayloadReader};
use super::composer::FrameComposer;
use super::dispatcher::DispatchError;
use super::{DataWidth, Opcode, WidthTable};
use bytes::Bytes;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Robot console text passed through from the serial link
    RawSerial(String),
    /// Simple opcode with a one-byte value
    Byte { opcode: Opcode, value: u8 },
    /// Simple opcode with a two-byte value
    Word { opcode: Opcode, value: u16 },
    /// Free-form console command for the robot
    Command(String),
    GetScripts,
    LuaScripts(Vec<String>),
    UploadLua { name: String, script: Vec<u8> },
    RunLua(Vec<u8>),
    UploadRunLua { name: String, script: Vec<u8> },
    RunServerLua(String),
    RemoveServerLua(String),
    GetServerLua(String),
    RequestedScript(Vec<u8>),
    ScriptRunning(bool),
    LuaText(String),
    /// Named event with a variable argument list
    LuaMsg { key: String, args: Vec<LuaArg> },
    LuaCommand { command: String, args: Vec<String> },
}

impl Message {
    pub fn byte(opcode: Opcode, value: u8) -> Self {
        Message::Byte { opcode, value }
    }

    pub fn word(opcode: Opcode, value: u16) -> Self {
        Message::Word { opcode, value }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Message::RawSerial(_) => Opcode::RawSerial,
            Message::Byte { opcode, .. } | Message::Word { opcode, .. } => *opcode,
            Message::Command(_) => Opcode::Command,
            Message::GetScripts => Opcode::GetScripts,
            Message::LuaScripts(_) => Opcode::LuaScripts,
            Message::UploadLua { .. } => Opcode::UploadLua,
            Message::RunLua(_) => Opcode::RunLua,
            Message::UploadRunLua { .. } => Opcode::UploadRunLua,
            Message::RunServerLua(_) => Opcode::RunServerLua,
            Message::RemoveServerLua(_) => Opcode::RemoveServerLua,
            Message::GetServerLua(_) => Opcode::GetServerLua,
            Message::RequestedScript(_) => Opcode::RequestedScript,
            Message::ScriptRunning(_) => Opcode::ScriptRunning,
            Message::LuaText(_) => Opcode::LuaText,
            Message::LuaMsg { .. } => Opcode::LuaMsg,
            Message::LuaCommand { .. } => Opcode::LuaCommand,
        }
    }

    /// Numeric value of a simple message.
    pub fn simple_value(&self) -> Option<u16> {
        match self {
            Message::Byte { value, .. } => Some(*value as u16),
            Message::Word { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Complete wire frame, length prefix included.
    pub fn encode(&self) -> Bytes {
        let mut c = FrameComposer::new(self.opcode());
        match self {
            Message::RawSerial(s)
            | Message::Command(s)
            | Message::RunServerLua(s)
            | Message::RemoveServerLua(s)
            | Message::GetServerLua(s)
            | Message::LuaText(s) => {
                c.put(s);
            }
            Message::Byte { value, .. } => {
                c.put(value);
            }
            Message::Word { value, .. } => {
                c.put(value);
            }
            Message::GetScripts => {}
            Message::LuaScripts(names) => {
                c.put(names);
            }
            Message::UploadLua { name, script } | Message::UploadRunLua { name, script } => {
                c.put(name).put(&Blob(script));
            }
            Message::RunLua(script) | Message::RequestedScript(script) => {
                c.put(&Blob(script));
            }
            Message::ScriptRunning(running) => {
                c.put(running);
            }
            Message::LuaMsg { key, args } => {
                c.put(key).put(args);
            }
            Message::LuaCommand { command, args } => {
                c.put(command).put(args);
            }
        }
        c.finish()
    }

    /// Decode a payload. Simple opcodes take their width from `widths`;
    /// structured opcodes read exactly the values their shape defines and
    /// leave anything after that unread in `r`.
    pub fn decode(opcode: Opcode, r: &mut PayloadReader<'_>, widths: &WidthTable) -> Result<Message, DispatchError> {
        if opcode.is_simple() {
            return match widths.get(opcode) {
                Some(DataWidth::Byte) => Ok(Message::byte(opcode, r.read_u8()?)),
                Some(DataWidth::Word) => Ok(Message::word(opcode, r.read_u16()?)),
                None => Err(DispatchError::MissingWidth(opcode)),
            };
        }

        let msg = match opcode {
            Opcode::RawSerial => Message::RawSerial(r.read_string()?),
            Opcode::Command => Message::Command(r.read_string()?),
            Opcode::GetScripts => Message::GetScripts,
            Opcode::LuaScripts => Message::LuaScripts(r.read_string_list()?),
            Opcode::UploadLua => Message::UploadLua { name: r.read_string()?, script: r.read_blob()? },
            Opcode::RunLua => Message::RunLua(r.read_blob()?),
            Opcode::UploadRunLua => Message::UploadRunLua { name: r.read_string()?, script: r.read_blob()? },
            Opcode::RunServerLua => Message::RunServerLua(r.read_string()?),
            Opcode::RemoveServerLua => Message::RemoveServerLua(r.read_string()?),
            Opcode::GetServerLua => Message::GetServerLua(r.read_string()?),
            Opcode::RequestedScript => Message::RequestedScript(r.read_blob()?),
            Opcode::ScriptRunning => Message::ScriptRunning(r.read_bool()?),
            Opcode::LuaText => Message::LuaText(r.read_string()?),
            Opcode::LuaMsg => {
                let key = r.read_string()?;
                let count = r.read_u32()? as usize;
                // Smallest argument is a tag plus a bool
                let mut args = Vec::with_capacity(count.min(r.remaining() / 2));
                for _ in 0..count {
                    args.push(r.read_lua_arg()?);
                }
                Message::LuaMsg { key, args }
            }
            Opcode::LuaCommand => Message::LuaCommand { command: r.read_string()?, args: r.read_string_list()? },
            simple => return Err(DispatchError::MissingWidth(simple)),
        };
        Ok(msg)
    }
}
