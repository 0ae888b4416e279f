//! Stream reassembly.
//!
//! One [`FrameReassembler`] per connection turns arbitrarily fragmented
//! reads into whole frames. It is a two-state machine:
//!
//! ```text
//! NeedLength ──(4 bytes buffered)──▶ NeedPayload { remaining }
//!     ▲                                    │
//!     └──────(remaining bytes buffered)────┘  frame yielded
//! ```
//!
//! A missing byte is never an error, only a reason to wait for the next
//! read. Frames are cut on their declared length before anything decodes
//! them, so a decoder that reads less than the declared region (desync),
//! an unknown opcode or a malformed payload only costs that one frame; the
//! bytes are drained and reported and the next frame starts aligned.
//!
//! A declared length above [`Limits::max_frame_len`] cannot be trusted to
//! resynchronize and is fatal for the connection.

use super::dispatcher::{DispatchError, MessageDispatcher, Outbox};
use super::{Frame, Limits, Opcode, LENGTH_PREFIX_LEN};
use bytes::{Buf, BytesMut};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    TooLarge { size: u32, max: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    NeedLength,
    NeedPayload { remaining: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Decoder consumed less than the declared length
    Desync,
    UnknownOpcode,
    /// Payload shorter than its opcode requires, or invalid content
    Malformed,
    /// Simple opcode with no width registered
    MissingWidth,
    /// Zero-length frame with no opcode byte
    Empty,
}

/// Bytes drained from one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discard {
    pub opcode: Option<u8>,
    pub bytes: usize,
    pub reason: DiscardReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassemblyReport {
    /// Complete frames cut from the stream, including drained ones
    pub frames: usize,
    pub discards: Vec<Discard>,
}

impl ReassemblyReport {
    pub fn discarded_bytes(&self) -> usize {
        self.discards.iter().map(|d| d.bytes).sum()
    }
}

pub struct FrameReassembler {
    buf: BytesMut,
    state: CursorState,
    limits: Limits,
    failed: Option<FrameError>,
    /// Zero-length frames drained by `next_frame`, reported by the caller
    drained: Vec<Discard>,
    pub dbg_frames: u64,
    pub dbg_discarded_bytes: u64,
}

impl FrameReassembler {
    pub fn new(limits: Limits) -> Self {
        FrameReassembler {
            buf: BytesMut::with_capacity(4096),
            state: CursorState::NeedLength,
            limits,
            failed: None,
            drained: Vec::new(),
            dbg_frames: 0,
            dbg_discarded_bytes: 0,
        }
    }

    pub fn state(&self) -> CursorState { self.state }

    /// Bytes received but not yet part of a yielded frame.
    pub fn buffered(&self) -> usize { self.buf.len() }

    pub fn is_failed(&self) -> bool { self.failed.is_some() }

    /// Append received bytes without processing them.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Single transition function of the cursor.
    ///
    /// `Ok(None)` means more bytes are needed. After an error the
    /// reassembler stays failed and returns the same error.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        loop {
            match self.state {
                CursorState::NeedLength => {
                    if self.buf.len() < LENGTH_PREFIX_LEN {
                        return Ok(None);
                    }
                    let len = self.buf.get_u32_le();
                    if len > self.limits.max_frame_len {
                        let err = FrameError::TooLarge { size: len, max: self.limits.max_frame_len };
                        error!(size = len, max = self.limits.max_frame_len, "declared frame length over limit");
                        self.failed = Some(err.clone());
                        return Err(err);
                    }
                    self.state = CursorState::NeedPayload { remaining: len };
                }
                CursorState::NeedPayload { remaining } => {
                    let remaining = remaining as usize;
                    if self.buf.len() < remaining {
                        return Ok(None);
                    }
                    self.state = CursorState::NeedLength;
                    if remaining == 0 {
                        warn!("dropping zero-length frame");
                        self.drained.push(Discard { opcode: None, bytes: 0, reason: DiscardReason::Empty });
                        continue;
                    }
                    let mut body = self.buf.split_to(remaining);
                    let opcode = body.get_u8();
                    self.dbg_frames += 1;
                    return Ok(Some(Frame { opcode, payload: body.freeze() }));
                }
            }
        }
    }

    /// Feed newly received bytes and dispatch every complete frame.
    pub fn on_bytes_available(
        &mut self,
        bytes: &[u8],
        dispatcher: &mut MessageDispatcher,
        outbox: &mut Outbox,
    ) -> Result<ReassemblyReport, FrameError> {
        self.extend(bytes);
        self.process(dispatcher, outbox)
    }

    /// Dispatch every complete frame already buffered.
    pub fn process(
        &mut self,
        dispatcher: &mut MessageDispatcher,
        outbox: &mut Outbox,
    ) -> Result<ReassemblyReport, FrameError> {
        let mut report = ReassemblyReport::default();
        loop {
            let next = self.next_frame();
            for d in self.drained.drain(..) {
                report.frames += 1;
                report.discards.push(d);
            }
            let Some(frame) = next? else { break };
            report.frames += 1;
            if let Some(d) = self.dispatch_one(&frame, dispatcher, outbox) {
                self.dbg_discarded_bytes += d.bytes as u64;
                report.discards.push(d);
            }
        }
        Ok(report)
    }

    fn dispatch_one(&self, frame: &Frame, dispatcher: &mut MessageDispatcher, outbox: &mut Outbox) -> Option<Discard> {
        let len = frame.payload.len();
        let discard = |bytes, reason| Some(Discard { opcode: Some(frame.opcode), bytes, reason });

        match dispatcher.dispatch(frame, outbox) {
            Ok(consumed) if consumed < len => {
                let extra = len - consumed;
                warn!(opcode = frame.opcode, "discarding {} unread payload bytes", extra);
                discard(extra, DiscardReason::Desync)
            }
            Ok(_) => {
                debug!(opcode = frame.opcode, len, "frame dispatched");
                None
            }
            Err(DispatchError::UnknownOpcode(op)) => {
                warn!("dropping {} payload bytes of unknown opcode 0x{:02X}", len, op);
                discard(len, DiscardReason::UnknownOpcode)
            }
            Err(DispatchError::MissingWidth(op)) => {
                error!(%op, "no width registered for simple opcode, dropping {} bytes", len);
                discard(len, DiscardReason::MissingWidth)
            }
            Err(DispatchError::Decode(e)) => {
                let op = Opcode::from_u8(frame.opcode);
                warn!(opcode = ?op, "dropping malformed frame ({} bytes): {}", len, e);
                discard(len, DiscardReason::Malformed)
            }
        }
    }
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(Limits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recording_dispatcher() -> (MessageDispatcher, Rc<RefCell<Vec<Message>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut d = MessageDispatcher::default();
        let s = seen.clone();
        d.register_catch_all(move |m, _| s.borrow_mut().push(m.clone()));
        (d, seen)
    }

    #[test]
    fn test_waits_for_length_without_consuming() {
        let mut r = FrameReassembler::default();
        r.extend(&[3, 0, 0]);
        assert_eq!(r.next_frame(), Ok(None));
        assert_eq!(r.state(), CursorState::NeedLength);
        assert_eq!(r.buffered(), 3);
    }

    #[test]
    fn test_remembers_length_across_reads() {
        let mut r = FrameReassembler::default();
        r.extend(&[3, 0, 0, 0, 0x05]);
        assert_eq!(r.next_frame(), Ok(None));
        assert_eq!(r.state(), CursorState::NeedPayload { remaining: 3 });
        r.extend(&[0xE6]);
        assert_eq!(r.next_frame(), Ok(None));
        r.extend(&[0x02]);
        let frame = r.next_frame().unwrap().unwrap();
        assert_eq!(frame, Frame::new(Opcode::Battery, vec![0xE6, 0x02]));
        assert_eq!(r.state(), CursorState::NeedLength);
    }

    #[test]
    fn test_desync_drains_unread_bytes() {
        let (mut d, seen) = recording_dispatcher();
        let mut r = FrameReassembler::default();
        let mut out = Outbox::new();
        // StateSensors is a byte opcode; two extra bytes were declared
        let mut stream = vec![4, 0, 0, 0, 0x01, 0xAA, 0xBB, 0xCC];
        stream.extend_from_slice(&Message::word(Opcode::Mic, 300).encode());

        let report = r.on_bytes_available(&stream, &mut d, &mut out).unwrap();
        assert_eq!(report.frames, 2);
        assert_eq!(
            report.discards,
            vec![Discard { opcode: Some(0x01), bytes: 2, reason: DiscardReason::Desync }]
        );
        assert_eq!(
            *seen.borrow(),
            vec![Message::byte(Opcode::StateSensors, 0xAA), Message::word(Opcode::Mic, 300)]
        );
        assert_eq!(r.dbg_discarded_bytes, 2);
    }

    #[test]
    fn test_unknown_and_malformed_keep_alignment() {
        let (mut d, seen) = recording_dispatcher();
        let mut r = FrameReassembler::default();
        let mut out = Outbox::new();
        let mut stream = vec![3, 0, 0, 0, 0x7E, 1, 2]; // unknown opcode
        stream.extend_from_slice(&[2, 0, 0, 0, 0x05, 9]); // word opcode, one byte
        stream.extend_from_slice(&[0, 0, 0, 0]); // empty frame
        stream.extend_from_slice(&Message::Command("stop".into()).encode());

        let report = r.on_bytes_available(&stream, &mut d, &mut out).unwrap();
        let reasons: Vec<_> = report.discards.iter().map(|d| d.reason).collect();
        assert_eq!(reasons, vec![DiscardReason::UnknownOpcode, DiscardReason::Malformed, DiscardReason::Empty]);
        assert_eq!(report.frames, 4);
        assert_eq!(*seen.borrow(), vec![Message::Command("stop".into())]);
    }

    #[test]
    fn test_missing_width_reported_separately() {
        let mut d = MessageDispatcher::new(crate::protocol::WidthTable::empty());
        let mut r = FrameReassembler::default();
        let report = r
            .on_bytes_available(&Message::byte(Opcode::AcsPower, 1).encode(), &mut d, &mut Outbox::new())
            .unwrap();
        assert_eq!(report.discards[0].reason, DiscardReason::MissingWidth);
    }

    #[test]
    fn test_oversized_length_is_fatal() {
        let (mut d, _) = recording_dispatcher();
        let mut r = FrameReassembler::new(Limits { max_frame_len: 16 });
        let mut out = Outbox::new();
        let err = r.on_bytes_available(&[17, 0, 0, 0], &mut d, &mut out).unwrap_err();
        assert_eq!(err, FrameError::TooLarge { size: 17, max: 16 });
        assert!(r.is_failed());
        // Stays failed even if valid data follows
        let again = r.on_bytes_available(&Message::GetScripts.encode(), &mut d, &mut out);
        assert_eq!(again, Err(err));
    }

    #[test]
    fn test_handler_reply_does_not_disturb_next_frame() {
        let mut d = MessageDispatcher::default();
        d.register_handler(Opcode::GetScripts, |_, out| out.send(&Message::LuaScripts(vec![])));
        let seen = Rc::new(RefCell::new(0));
        let s = seen.clone();
        d.register_handler(Opcode::Battery, move |_, _| *s.borrow_mut() += 1);

        let mut stream = Message::GetScripts.encode().to_vec();
        stream.extend_from_slice(&Message::word(Opcode::Battery, 1).encode()[..3]);
        let mut r = FrameReassembler::default();
        let mut out = Outbox::new();
        r.on_bytes_available(&stream, &mut d, &mut out).unwrap();
        assert_eq!(out.take_replies().len(), 1);

        let tail = Message::word(Opcode::Battery, 1).encode();
        r.on_bytes_available(&tail[3..], &mut d, &mut out).unwrap();
        assert_eq!(*seen.borrow(), 1);
    }
}
