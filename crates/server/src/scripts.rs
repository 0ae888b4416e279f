//! In-memory script store.
//!
//! Clients upload, list, download and remove scripts by name. Nothing is
//! executed here: run requests are answered with a text notice and
//! `ScriptRunning(false)`.

use rp6_remote_core::protocol::{MessageDispatcher, Opcode, Outbox};
use rp6_remote_core::Message;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{info, warn};

pub const EXECUTION_UNAVAILABLE: &str = "script execution unavailable";

#[derive(Debug, Default)]
pub struct ScriptRegistry {
    scripts: BTreeMap<String, Vec<u8>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        self.scripts.keys().cloned().collect()
    }

    pub fn upload(&mut self, name: &str, script: &[u8]) {
        info!(name, bytes = script.len(), "script stored");
        self.scripts.insert(name.to_string(), script.to_vec());
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.scripts.get(name).map(Vec::as_slice)
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.scripts.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    /// Apply one script-management message, queueing the replies.
    pub fn handle(&mut self, msg: &Message, out: &mut Outbox) {
        match msg {
            Message::GetScripts => out.send(&Message::LuaScripts(self.names())),
            Message::UploadLua { name, script } => {
                self.upload(name, script);
                out.broadcast(&Message::LuaScripts(self.names()));
            }
            Message::UploadRunLua { name, script } => {
                self.upload(name, script);
                out.broadcast(&Message::LuaScripts(self.names()));
                refuse_run(out);
            }
            Message::RunLua(_) | Message::RunServerLua(_) => refuse_run(out),
            Message::RemoveServerLua(name) => {
                if self.remove(name) {
                    out.broadcast(&Message::LuaScripts(self.names()));
                } else {
                    warn!(%name, "remove of unknown script");
                }
            }
            Message::GetServerLua(name) => match self.get(name) {
                Some(script) => out.send(&Message::RequestedScript(script.to_vec())),
                None => out.send(&Message::LuaText(format!("no script named '{}'", name))),
            },
            _ => {}
        }
    }
}

fn refuse_run(out: &mut Outbox) {
    out.send(&Message::LuaText(EXECUTION_UNAVAILABLE.to_string()));
    out.send(&Message::ScriptRunning(false));
}

/// Route every script opcode of `dispatcher` to `registry`.
pub fn install(dispatcher: &mut MessageDispatcher, registry: Rc<RefCell<ScriptRegistry>>) {
    for op in [
        Opcode::GetScripts,
        Opcode::UploadLua,
        Opcode::UploadRunLua,
        Opcode::RunLua,
        Opcode::RunServerLua,
        Opcode::RemoveServerLua,
        Opcode::GetServerLua,
    ] {
        let registry = registry.clone();
        dispatcher.register_handler(op, move |msg, out| registry.borrow_mut().handle(msg, out));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_list_download_remove() {
        let mut reg = ScriptRegistry::new();
        let mut out = Outbox::new();
        reg.handle(&Message::UploadLua { name: "b.lua".into(), script: b"b()".to_vec() }, &mut out);
        reg.handle(&Message::UploadLua { name: "a.lua".into(), script: b"a()".to_vec() }, &mut out);
        assert_eq!(out.take_broadcasts().len(), 2);

        reg.handle(&Message::GetScripts, &mut out);
        assert_eq!(out.take_replies(), vec![Message::LuaScripts(vec!["a.lua".into(), "b.lua".into()]).encode()]);

        reg.handle(&Message::GetServerLua("a.lua".into()), &mut out);
        assert_eq!(out.take_replies(), vec![Message::RequestedScript(b"a()".to_vec()).encode()]);

        reg.handle(&Message::RemoveServerLua("a.lua".into()), &mut out);
        assert_eq!(reg.len(), 1);
        reg.handle(&Message::RemoveServerLua("zzz.lua".into()), &mut out);
        assert_eq!(out.take_broadcasts().len(), 1);
    }

    #[test]
    fn test_run_requests_are_refused() {
        let mut reg = ScriptRegistry::new();
        let mut out = Outbox::new();
        reg.handle(&Message::RunServerLua("x.lua".into()), &mut out);
        assert_eq!(
            out.take_replies(),
            vec![
                Message::LuaText(EXECUTION_UNAVAILABLE.into()).encode(),
                Message::ScriptRunning(false).encode(),
            ]
        );
    }

    #[test]
    fn test_install_routes_through_dispatcher() {
        let registry = Rc::new(RefCell::new(ScriptRegistry::new()));
        let mut d = MessageDispatcher::default();
        install(&mut d, registry.clone());
        let frame = Message::UploadLua { name: "s.lua".into(), script: vec![1] }.encode();
        let mut r = rp6_remote_core::FrameReassembler::default();
        let mut out = Outbox::new();
        r.on_bytes_available(&frame, &mut d, &mut out).unwrap();
        assert_eq!(registry.borrow().names(), vec!["s.lua".to_string()]);
    }
}
