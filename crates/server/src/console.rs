//! `console` mode: a line-oriented client.
//!
//! Prints robot console text as-is and every other message in a short
//! `name value` form. Lines typed on stdin are sent as `Command` frames;
//! `quit` exits.

use crate::ConsoleArgs;
use anyhow::Context;
use rp6_remote_core::net::ConnectionEvent;
use rp6_remote_core::protocol::{Limits, LuaArg, MessageDispatcher};
use rp6_remote_core::{Message, TcpClient};
use std::io::{self, BufRead};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One-line rendering of a received message.
pub fn describe(msg: &Message) -> String {
    match msg {
        Message::RawSerial(text) => text.clone(),
        Message::Byte { opcode, value } => format!("{:?} {}", opcode, value),
        Message::Word { opcode, value } => format!("{:?} {}", opcode, value),
        Message::LuaScripts(names) => format!("scripts: {}", names.join(", ")),
        Message::RequestedScript(script) => format!("script ({} bytes)", script.len()),
        Message::ScriptRunning(running) => format!("script running: {}", running),
        Message::LuaText(text) => format!("lua: {}", text),
        Message::LuaMsg { key, args } => {
            let args: Vec<String> = args
                .iter()
                .map(|a| match a {
                    LuaArg::Bool(b) => b.to_string(),
                    LuaArg::Float(f) => f.to_string(),
                    LuaArg::Str(s) => format!("{:?}", s),
                })
                .collect();
            format!("{}({})", key, args.join(", "))
        }
        other => format!("{:?}", other),
    }
}

pub fn run(args: ConsoleArgs) -> anyhow::Result<()> {
    let mut client = TcpClient::connect((args.host.as_str(), args.port), Limits::default())
        .with_context(|| format!("connecting to {}:{}", args.host, args.port))?;

    let mut dispatcher = MessageDispatcher::default();
    dispatcher.register_catch_all(|msg, _| println!("{}", describe(msg)));

    let (tx, rx) = mpsc::channel();
    thread::Builder::new().name("stdin".into()).spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    })?;

    loop {
        match client.poll(&mut dispatcher) {
            ConnectionEvent::Lost { reason } => {
                eprintln!("Disconnected: {}", reason);
                return Ok(());
            }
            ConnectionEvent::Data(report) => debug!(frames = report.frames, "received"),
            ConnectionEvent::Idle => {}
        }

        while let Ok(line) = rx.try_recv() {
            let line = line.trim();
            if line == "quit" {
                client.close();
                return Ok(());
            }
            if !line.is_empty() {
                client.send(&Message::Command(line.to_string())).context("sending command")?;
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rp6_remote_core::Opcode;

    #[test]
    fn test_describe() {
        assert_eq!(describe(&Message::RawSerial("[READY]".into())), "[READY]");
        assert_eq!(describe(&Message::word(Opcode::Battery, 742)), "Battery 742");
        assert_eq!(
            describe(&Message::LuaMsg { key: "hit".into(), args: vec![LuaArg::Bool(true), LuaArg::Str("l".into())] }),
            "hit(true, \"l\")"
        );
    }
}
