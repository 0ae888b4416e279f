//! `serve` mode main loop.
//!
//! Single-threaded poll loop: accept and service TCP clients, forward
//! client commands to the robot, turn robot serial output into `RawSerial`
//! broadcasts and publish changed simulator values. Blocking reads of the
//! serial device and of stdin run on helper threads that hand data over
//! through channels.
//!
//! Typing `quit` on stdin stops the server (and writes `--save-state`).

use crate::scripts::{self, ScriptRegistry};
use crate::sim::SimRobot;
use crate::ServeArgs;
use anyhow::Context;
use rp6_remote_core::net::ServerEvent;
use rp6_remote_core::protocol::{Limits, MessageDispatcher};
use rp6_remote_core::serial::{command_bytes, LineSplitter};
use rp6_remote_core::{savestate, Message, Opcode, TcpServer};
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Read, Write};
use std::path::Path;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Robot serial device, read on a helper thread.
struct SerialLink {
    writer: File,
    rx: Receiver<io::Result<Vec<u8>>>,
}

impl SerialLink {
    fn open(path: &Path) -> io::Result<Self> {
        let writer = OpenOptions::new().read(true).write(true).open(path)?;
        let mut reader = writer.try_clone()?;
        let (tx, rx) = mpsc::channel();
        thread::Builder::new().name("serial-reader".into()).spawn(move || {
            let mut buf = [0u8; 512];
            loop {
                let msg = match reader.read(&mut buf) {
                    Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "serial device closed")),
                    Ok(n) => Ok(buf[..n].to_vec()),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => Err(e),
                };
                let done = msg.is_err();
                if tx.send(msg).is_err() || done {
                    break;
                }
            }
        })?;
        info!(path = %path.display(), "serial device opened");
        Ok(SerialLink { writer, rx })
    }

    /// Everything read since the last call, plus the read error that ended
    /// the link, if any.
    fn poll(&mut self) -> (Vec<u8>, Option<io::Error>) {
        drain_reads(&self.rx)
    }

    fn write_command(&mut self, cmd: &str) -> io::Result<()> {
        self.writer.write_all(&command_bytes(cmd))?;
        self.writer.flush()
    }
}

/// Collect queued reads. Bytes read before a failure are still returned.
fn drain_reads(rx: &Receiver<io::Result<Vec<u8>>>) -> (Vec<u8>, Option<io::Error>) {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(Ok(chunk)) => out.extend_from_slice(&chunk),
            Ok(Err(e)) => return (out, Some(e)),
            Err(TryRecvError::Empty) => return (out, None),
            Err(TryRecvError::Disconnected) => {
                return (out, Some(io::Error::new(io::ErrorKind::BrokenPipe, "serial reader stopped")))
            }
        }
    }
}

fn spawn_stdin_reader() -> io::Result<Receiver<String>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new().name("stdin".into()).spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    })?;
    Ok(rx)
}

pub fn run(args: ServeArgs) -> anyhow::Result<()> {
    if args.serial.is_none() && !args.simulate {
        warn!("no --serial device and no --simulate: only script storage is available");
    }

    let limits = Limits { max_frame_len: args.max_frame };
    let mut server = TcpServer::bind((args.bind.as_str(), args.port), limits)
        .with_context(|| format!("binding {}:{}", args.bind, args.port))?;

    let mut dispatcher = MessageDispatcher::default();
    let registry = Rc::new(RefCell::new(ScriptRegistry::new()));
    scripts::install(&mut dispatcher, registry);

    let commands: Rc<RefCell<Vec<String>>> = Rc::default();
    let queued = commands.clone();
    dispatcher.register_handler(Opcode::Command, move |msg, _| {
        if let Message::Command(text) = msg {
            queued.borrow_mut().push(text.clone());
        }
    });
    dispatcher.register_catch_all(|msg, _| debug!(opcode = %msg.opcode(), "client message"));

    let mut serial = match &args.serial {
        Some(path) => Some(SerialLink::open(path).with_context(|| format!("opening {}", path.display()))?),
        None => None,
    };
    let mut sim = if args.simulate {
        Some(SimRobot::start(args.clock_speed, args.cpu_usage, args.load_state.as_deref())?)
    } else {
        None
    };

    let stdin = spawn_stdin_reader()?;
    let mut splitter = LineSplitter::new();
    let poll = Duration::from_millis(args.poll_ms.max(1));

    loop {
        for event in server.poll(&mut dispatcher) {
            match event {
                ServerEvent::Connected { .. } => {
                    if let Some(sim) = sim.as_mut() {
                        sim.resend_all();
                    }
                }
                ServerEvent::Disconnected { id, reason } => debug!(id = id.0, %reason, "client gone"),
            }
        }

        let mut quit = false;
        while let Ok(line) = stdin.try_recv() {
            if line.trim() == "quit" {
                quit = true;
            } else if !line.trim().is_empty() {
                commands.borrow_mut().push(line);
            }
        }

        let pending: Vec<String> = commands.borrow_mut().drain(..).collect();
        for cmd in pending {
            if let Some(reply) = sim.as_ref().and_then(|s| s.command(&cmd)) {
                server.broadcast_message(&Message::RawSerial(reply));
            } else if let Some(link) = serial.as_mut() {
                if let Err(e) = link.write_command(&cmd) {
                    error!("serial write failed: {}", e);
                    serial = None;
                }
            } else {
                server.broadcast_message(&Message::RawSerial(format!("no robot attached: {}", cmd)));
            }
        }

        if let Some(link) = serial.as_mut() {
            let (bytes, failure) = link.poll();
            for line in splitter.push(&bytes) {
                server.broadcast_message(&Message::RawSerial(line));
            }
            if let Some(e) = failure {
                error!("serial link lost: {}", e);
                if let Some(rest) = splitter.flush() {
                    server.broadcast_message(&Message::RawSerial(rest));
                }
                serial = None;
            }
        }

        if let Some(sim) = sim.as_mut() {
            for msg in sim.changed() {
                server.broadcast_message(&msg);
            }
        }

        server.flush();
        if quit {
            break;
        }
        thread::sleep(poll);
    }

    info!("shutting down");
    if let Some(sim) = sim {
        let clock = sim.stop()?;
        if let Some(path) = &args.save_state {
            savestate::save_to_file(&clock.save_state(), path)
                .with_context(|| format!("writing clock state {}", path.display()))?;
            info!(path = %path.display(), ticks = %clock.current_ticks(), "clock state saved");
        }
    }
    Ok(())
}
