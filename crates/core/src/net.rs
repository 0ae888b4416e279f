//! TCP transport for the remote-control protocol.
//!
//! Sockets run in non-blocking mode and are polled from the owner's main
//! loop. Each [`Connection`] owns its own [`FrameReassembler`]; the
//! [`MessageDispatcher`] is shared by reference across all connections of a
//! server. A socket error, an orderly close or a fatal framing error all
//! collapse into a single [`ConnectionEvent::Lost`], after which the
//! connection's cursor is gone and nothing more is dispatched for it.
//!
//! ## Usage
//!
//! ```text
//! # Server bridging /dev/ttyUSB0 on the default port 40000:
//! rp6-remote serve --serial /dev/ttyUSB0
//!
//! # Console client:
//! rp6-remote console --host 192.168.1.20
//! ```

use crate::protocol::{FrameReassembler, Limits, Message, MessageDispatcher, Outbox, ReassemblyReport};
use bytes::{Buf, BytesMut};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

/// Default server port
pub const DEFAULT_PORT: u16 = 40000;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Nothing arrived
    Idle,
    Data(ReassemblyReport),
    /// The connection is closed; no further frames will be dispatched
    Lost { reason: String },
}

/// One framed byte stream.
pub struct Connection<T> {
    stream: T,
    peer: String,
    cursor: Option<FrameReassembler>,
    pending: BytesMut,
    lost: Option<String>,
}

impl<T: Read + Write> Connection<T> {
    pub fn new(stream: T, peer: impl Into<String>, limits: Limits) -> Self {
        Connection {
            stream,
            peer: peer.into(),
            cursor: Some(FrameReassembler::new(limits)),
            pending: BytesMut::new(),
            lost: None,
        }
    }

    pub fn peer(&self) -> &str { &self.peer }
    pub fn is_open(&self) -> bool { self.cursor.is_some() }
    /// Why the connection closed, once it has.
    pub fn lost_reason(&self) -> Option<&str> { self.lost.as_deref() }
    pub fn get_ref(&self) -> &T { &self.stream }

    /// Bytes queued but not yet accepted by the socket.
    pub fn pending_out(&self) -> usize { self.pending.len() }

    /// Queue an encoded frame for the next [`flush`](Self::flush).
    pub fn queue(&mut self, frame: &[u8]) {
        if self.is_open() {
            self.pending.extend_from_slice(frame);
        }
    }

    pub fn send(&mut self, msg: &Message) {
        self.queue(&msg.encode());
    }

    /// Write as much queued data as the socket accepts without blocking.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "socket accepted no data")),
                Ok(n) => self.pending.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        match self.stream.flush() {
            Err(e) if e.kind() != ErrorKind::WouldBlock => Err(e),
            _ => Ok(()),
        }
    }

    /// Tear down the cursor and any unsent data.
    pub fn close(&mut self, reason: impl Into<String>) -> ConnectionEvent {
        let reason = reason.into();
        if self.cursor.take().is_some() {
            info!(peer = %self.peer, %reason, "connection lost");
            self.lost = Some(reason.clone());
        }
        self.pending.clear();
        ConnectionEvent::Lost { reason }
    }

    /// Read everything available and dispatch the complete frames.
    pub fn poll(&mut self, dispatcher: &mut MessageDispatcher, outbox: &mut Outbox) -> ConnectionEvent {
        let Some(cursor) = self.cursor.as_mut() else {
            let reason = self.lost.clone().unwrap_or_else(|| "connection closed".into());
            return ConnectionEvent::Lost { reason };
        };

        let mut report = ReassemblyReport::default();
        let mut chunk = [0u8; READ_CHUNK];
        let lost = loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => break Some("closed by peer".to_string()),
                Ok(n) => match cursor.on_bytes_available(&chunk[..n], dispatcher, outbox) {
                    Ok(r) => {
                        report.frames += r.frames;
                        report.discards.extend(r.discards);
                    }
                    Err(e) => break Some(e.to_string()),
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => break None,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Some(e.to_string()),
            }
        };

        if let Some(reason) = lost {
            return self.close(reason);
        }
        if report.frames == 0 {
            ConnectionEvent::Idle
        } else {
            debug!(peer = %self.peer, frames = report.frames, "frames received");
            ConnectionEvent::Data(report)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected { id: ClientId, peer: SocketAddr },
    Disconnected { id: ClientId, reason: String },
}

/// Accepts clients and exchanges frames with all of them.
///
/// Handler replies go back to the client whose frame produced them;
/// handler broadcasts go to every client.
pub struct TcpServer {
    listener: TcpListener,
    clients: Vec<(ClientId, Connection<TcpStream>)>,
    limits: Limits,
    next_id: u64,
    /// Total clients accepted
    pub dbg_accepted: u64,
}

impl TcpServer {
    pub fn bind(addr: impl ToSocketAddrs, limits: Limits) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!(addr = %listener.local_addr()?, "server listening");
        Ok(TcpServer { listener, clients: Vec::new(), limits, next_id: 0, dbg_accepted: 0 })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.clients.iter().map(|(id, _)| *id)
    }

    fn accept_pending(&mut self, events: &mut Vec<ServerEvent>) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true).and_then(|_| stream.set_nodelay(true)) {
                        warn!(%peer, "rejecting client: {}", e);
                        continue;
                    }
                    let id = ClientId(self.next_id);
                    self.next_id += 1;
                    self.dbg_accepted += 1;
                    info!(%peer, id = id.0, "client connected");
                    self.clients.push((id, Connection::new(stream, peer.to_string(), self.limits)));
                    events.push(ServerEvent::Connected { id, peer });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Accept new clients, dispatch their frames and flush output.
    pub fn poll(&mut self, dispatcher: &mut MessageDispatcher) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        self.accept_pending(&mut events);

        let mut broadcasts = Vec::new();
        for (_, conn) in self.clients.iter_mut() {
            let mut outbox = Outbox::new();
            // A lost client's replies are dropped by `queue`, but broadcasts
            // from its final frames still reach the others.
            conn.poll(dispatcher, &mut outbox);
            for frame in outbox.take_replies() {
                conn.queue(&frame);
            }
            broadcasts.extend(outbox.take_broadcasts());
        }
        for frame in &broadcasts {
            self.broadcast(frame);
        }

        self.flush_all();
        self.clients.retain_mut(|(id, conn)| {
            if conn.is_open() {
                return true;
            }
            let reason = conn.lost_reason().unwrap_or("connection lost").to_string();
            events.push(ServerEvent::Disconnected { id: *id, reason });
            false
        });
        events
    }

    fn flush_all(&mut self) {
        for (_, conn) in self.clients.iter_mut() {
            if conn.is_open() {
                if let Err(e) = conn.flush() {
                    conn.close(e.to_string());
                }
            }
        }
    }

    /// Queue an encoded frame for every client.
    pub fn broadcast(&mut self, frame: &[u8]) {
        for (_, conn) in self.clients.iter_mut() {
            conn.queue(frame);
        }
    }

    pub fn broadcast_message(&mut self, msg: &Message) {
        self.broadcast(&msg.encode());
    }

    /// Returns false for an unknown or closed client.
    pub fn send_to(&mut self, id: ClientId, frame: &[u8]) -> bool {
        match self.clients.iter_mut().find(|(cid, _)| *cid == id) {
            Some((_, conn)) if conn.is_open() => {
                conn.queue(frame);
                true
            }
            _ => false,
        }
    }

    /// Write queued output now instead of waiting for the next poll.
    pub fn flush(&mut self) {
        self.flush_all();
    }
}

/// Client side of the protocol.
pub struct TcpClient {
    conn: Connection<TcpStream>,
}

impl TcpClient {
    /// Connect and request the server's script list.
    pub fn connect(addr: impl ToSocketAddrs, limits: Limits) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        info!(%peer, "connected to server");

        let mut conn = Connection::new(stream, peer.to_string(), limits);
        conn.send(&Message::GetScripts);
        conn.flush()?;
        Ok(TcpClient { conn })
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    pub fn peer(&self) -> &str {
        self.conn.peer()
    }

    pub fn send(&mut self, msg: &Message) -> io::Result<()> {
        self.conn.send(msg);
        self.conn.flush()
    }

    /// Dispatch everything received; handler output goes to the server.
    pub fn poll(&mut self, dispatcher: &mut MessageDispatcher) -> ConnectionEvent {
        let mut outbox = Outbox::new();
        let event = self.conn.poll(dispatcher, &mut outbox);
        if let ConnectionEvent::Lost { .. } = event {
            return event;
        }
        for frame in outbox.take_replies().into_iter().chain(outbox.take_broadcasts()) {
            self.conn.queue(&frame);
        }
        match self.conn.flush() {
            Ok(()) => event,
            Err(e) => self.conn.close(e.to_string()),
        }
    }

    pub fn close(&mut self) {
        self.conn.close("closed locally");
    }
}
