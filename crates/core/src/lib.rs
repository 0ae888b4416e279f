//! # rp6-remote-core
//!
//! Protocol and timing core for the RP6 robot remote-control stack.
//!
//! The robot's serial link is bridged to TCP clients by a server; every peer
//! speaks the same length-prefixed frame protocol. Firmware behaviour can be
//! simulated on the PC against a virtual AVR clock.
//!
//! ## Architecture
//!
//! - [`protocol`]: Opcodes, frame composer, stream reassembler, message dispatcher
//! - [`net`]: Non-blocking TCP server, client and per-connection framing
//! - [`serial`]: Line splitting of robot console output
//! - [`ticks`]: Overflow-safe simulated tick counter
//! - [`timer`]: Simulated AVR timer with compare value and prescaler
//! - [`clock`]: Simulated AVR clock scheduling timers, plus a threaded driver
//! - [`stats`]: Effective clock speed statistics
//! - [`savestate`]: Save and restore of clock and timer state
//!
//! ## Data flow
//!
//! ```text
//! Message::encode ─▶ TCP / serial ─▶ FrameReassembler ─▶ MessageDispatcher ─▶ handlers
//!                                                                  │
//!                                          Outbox (replies) ◀──────┘
//! ```

pub mod clock;
pub mod net;
pub mod protocol;
pub mod savestate;
pub mod serial;
pub mod stats;
pub mod ticks;
pub mod timer;

pub use clock::{AvrClock, ClockDriver, ClockError, CpuUsage, SharedValue, TimerHandle, RP6_CLOCK_HZ};
pub use net::{ConnectionEvent, TcpClient, TcpServer, DEFAULT_PORT};
pub use protocol::{Frame, FrameReassembler, Message, MessageDispatcher, Opcode, DEFAULT_MAX_FRAME_LEN};
pub use ticks::Ticks;
pub use timer::AvrTimer;
