//! TCP server and client over the loopback interface.

use rp6_remote_core::net::{ConnectionEvent, ServerEvent, TcpClient, TcpServer};
use rp6_remote_core::protocol::{Limits, Message, MessageDispatcher, Opcode};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

fn poll_until(mut step: impl FnMut() -> bool) {
    let start = Instant::now();
    while !step() {
        assert!(start.elapsed() < TIMEOUT, "timed out");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_client_requests_scripts_on_connect() {
    let mut server = TcpServer::bind("127.0.0.1:0", Limits::default()).unwrap();
    let addr = server.local_addr().unwrap();

    let mut server_d = MessageDispatcher::default();
    server_d.register_handler(Opcode::GetScripts, |_, out| {
        out.send(&Message::LuaScripts(vec!["demo.lua".into()]));
    });

    let mut client = TcpClient::connect(addr, Limits::default()).unwrap();
    let received = Rc::new(RefCell::new(Vec::new()));
    let r = received.clone();
    let mut client_d = MessageDispatcher::default();
    client_d.register_catch_all(move |m, _| r.borrow_mut().push(m.clone()));

    let mut connected = false;
    poll_until(|| {
        for ev in server.poll(&mut server_d) {
            if let ServerEvent::Connected { .. } = ev {
                connected = true;
            }
        }
        client.poll(&mut client_d);
        !received.borrow().is_empty()
    });
    assert!(connected);
    assert_eq!(*received.borrow(), vec![Message::LuaScripts(vec!["demo.lua".into()])]);
}

#[test]
fn test_broadcast_reaches_every_client_and_loss_is_reported() {
    let mut server = TcpServer::bind("127.0.0.1:0", Limits::default()).unwrap();
    let addr = server.local_addr().unwrap();
    let mut server_d = MessageDispatcher::default();

    let mut a = TcpClient::connect(addr, Limits::default()).unwrap();
    let mut b = TcpClient::connect(addr, Limits::default()).unwrap();
    poll_until(|| {
        server.poll(&mut server_d);
        server.client_count() == 2
    });

    server.broadcast_message(&Message::RawSerial("[READY]".into()));
    server.flush();

    let count = Rc::new(RefCell::new(0));
    let mut d = MessageDispatcher::default();
    let c = count.clone();
    d.register_handler(Opcode::RawSerial, move |_, _| *c.borrow_mut() += 1);
    poll_until(|| {
        a.poll(&mut d);
        b.poll(&mut d);
        *count.borrow() == 2
    });

    drop(a);
    let mut gone = false;
    poll_until(|| {
        for ev in server.poll(&mut server_d) {
            if let ServerEvent::Disconnected { .. } = ev {
                gone = true;
            }
        }
        gone
    });
    assert_eq!(server.client_count(), 1);
    assert!(!matches!(b.poll(&mut d), ConnectionEvent::Lost { .. }));
}

#[test]
fn test_broadcast_survives_sender_disconnect() {
    use std::io::Write;

    let mut server = TcpServer::bind("127.0.0.1:0", Limits::default()).unwrap();
    let addr = server.local_addr().unwrap();
    let mut server_d = MessageDispatcher::default();
    server_d.register_handler(Opcode::UploadLua, |m, out| {
        if let Message::UploadLua { name, .. } = m {
            out.broadcast(&Message::LuaScripts(vec![name.clone()]));
        }
    });

    let mut watcher = TcpClient::connect(addr, Limits::default()).unwrap();
    poll_until(|| {
        server.poll(&mut server_d);
        server.client_count() == 1
    });

    // Upload then hang up before the server gets to poll
    let mut uploader = std::net::TcpStream::connect(addr).unwrap();
    let upload = Message::UploadLua { name: "hit.lua".into(), script: b"x = 1".to_vec() };
    uploader.write_all(&upload.encode()).unwrap();
    drop(uploader);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let s = seen.clone();
    let mut d = MessageDispatcher::default();
    d.register_handler(Opcode::LuaScripts, move |m, _| s.borrow_mut().push(m.clone()));

    let mut gone = 0;
    poll_until(|| {
        for ev in server.poll(&mut server_d) {
            if let ServerEvent::Disconnected { .. } = ev {
                gone += 1;
            }
        }
        watcher.poll(&mut d);
        gone == 1 && !seen.borrow().is_empty()
    });
    assert_eq!(*seen.borrow(), vec![Message::LuaScripts(vec!["hit.lua".into()])]);
    assert_eq!(server.client_count(), 1);
}
