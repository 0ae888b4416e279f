//! Opcode routing.
//!
//! A [`MessageDispatcher`] owns the width table and the handler table for one
//! protocol instance. Handlers run synchronously, in registration order, and
//! reply through the [`Outbox`] they are given instead of touching any
//! connection directly. Outbound frames therefore never interleave with the
//! reassembler's buffer for the frame that is being dispatched.

use super::codec::{DecodeError, PayloadReader};
use super::message::Message;
use super::{Frame, Opcode, WidthTable};
use bytes::Bytes;
use std::collections::HashMap;
use thiserror::Error;
use tracing::trace;

pub type Handler = Box<dyn FnMut(&Message, &mut Outbox)>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),
    #[error("no width registered for simple opcode {0}")]
    MissingWidth(Opcode),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Frames queued by handlers while a frame is being dispatched.
#[derive(Debug, Default)]
pub struct Outbox {
    replies: Vec<Bytes>,
    broadcasts: Vec<Bytes>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply to the peer the current frame came from.
    pub fn send(&mut self, msg: &Message) {
        self.replies.push(msg.encode());
    }

    /// Queue a frame for every connected peer.
    pub fn broadcast(&mut self, msg: &Message) {
        self.broadcasts.push(msg.encode());
    }

    pub fn send_frame(&mut self, frame: Bytes) {
        self.replies.push(frame);
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty() && self.broadcasts.is_empty()
    }

    pub fn take_replies(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.replies)
    }

    pub fn take_broadcasts(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.broadcasts)
    }
}

pub struct MessageDispatcher {
    widths: WidthTable,
    handlers: HashMap<Opcode, Vec<Handler>>,
    catch_all: Vec<Handler>,
    /// Frames successfully decoded
    pub dbg_dispatched: u64,
}

impl MessageDispatcher {
    pub fn new(widths: WidthTable) -> Self {
        MessageDispatcher {
            widths,
            handlers: HashMap::new(),
            catch_all: Vec::new(),
            dbg_dispatched: 0,
        }
    }

    pub fn widths(&self) -> &WidthTable { &self.widths }
    pub fn widths_mut(&mut self) -> &mut WidthTable { &mut self.widths }

    pub fn register_handler<F>(&mut self, opcode: Opcode, handler: F)
    where
        F: FnMut(&Message, &mut Outbox) + 'static,
    {
        self.handlers.entry(opcode).or_default().push(Box::new(handler));
    }

    /// Handler invoked for every decoded message, after the per-opcode ones.
    pub fn register_catch_all<F>(&mut self, handler: F)
    where
        F: FnMut(&Message, &mut Outbox) + 'static,
    {
        self.catch_all.push(Box::new(handler));
    }

    pub fn handler_count(&self, opcode: Opcode) -> usize {
        self.handlers.get(&opcode).map_or(0, Vec::len)
    }

    /// Decode one frame and run its handlers.
    ///
    /// Returns the number of payload bytes the decoder consumed, which may be
    /// less than the payload length.
    pub fn dispatch(&mut self, frame: &Frame, outbox: &mut Outbox) -> Result<usize, DispatchError> {
        let opcode = Opcode::from_u8(frame.opcode).ok_or(DispatchError::UnknownOpcode(frame.opcode))?;
        let mut reader = PayloadReader::new(&frame.payload);
        let msg = Message::decode(opcode, &mut reader, &self.widths)?;
        let consumed = reader.consumed();
        trace!(%opcode, consumed, "dispatch");

        if let Some(handlers) = self.handlers.get_mut(&opcode) {
            for h in handlers.iter_mut() {
                h(&msg, outbox);
            }
        }
        for h in self.catch_all.iter_mut() {
            h(&msg, outbox);
        }
        self.dbg_dispatched += 1;
        Ok(consumed)
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new(WidthTable::standard())
    }
}
