use std::{
    io::{Read, Write},
    net::TcpListener,
    sync::mpsc,
    thread,
    time::Duration,
};

use bytes::Bytes;
use castor_net::{ConnEvent, ConnectParams, EventLoop, Flow, Io, Session};

struct Probe {
    tx: mpsc::Sender<String>,
}

impl Session for Probe {
    fn on_event(&mut self, io: &mut Io<'_>, ev: ConnEvent) -> Flow {
        match ev {
            ConnEvent::Connected => {
                self.tx.send("connected".into()).unwrap();
                io.write(Bytes::from_static(b"PING\r\n"));
                Flow::Continue
            }
            ConnEvent::Eof => {
                self.tx.send("eof".into()).unwrap();
                Flow::Close
            }
            other => {
                self.tx.send(format!("unexpected:{other:?}")).unwrap();
                Flow::Close
            }
        }
    }

    fn on_readable(&mut self, io: &mut Io<'_>) -> Flow {
        while let Some(line) = io.read_line() {
            self.tx.send(format!("line:{line}")).unwrap();
        }
        Flow::Continue
    }
}

#[test]
fn connect_write_read_lines_then_eof() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let mut got = Vec::new();
        let mut buf = [0u8; 64];
        while !got.ends_with(b"\r\n") {
            let n = sock.read(&mut buf).unwrap();
            assert_ne!(n, 0, "client hung up early");
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"PING\r\n");
        sock.write_all(b"PONG\r\nDONE\r\n").unwrap();
    });

    let (mut evloop, handle) = EventLoop::new().unwrap();
    let loop_thread = thread::spawn(move || evloop.run());

    let (tx, rx) = mpsc::channel();
    handle
        .connect(
            ConnectParams {
                host: "127.0.0.1".into(),
                port: addr.port(),
                tls: false,
                read_timeout: Some(Duration::from_secs(5)),
                write_timeout: Some(Duration::from_secs(5)),
            },
            Box::new(Probe { tx }),
        )
        .unwrap();

    for expected in ["connected", "line:PONG", "line:DONE", "eof"] {
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, expected);
    }

    server.join().unwrap();
    handle.shutdown();
    loop_thread.join().unwrap();
}

#[test]
fn timer_fires_and_cancel_suppresses() {
    let (mut evloop, handle) = EventLoop::new().unwrap();
    let loop_thread = thread::spawn(move || evloop.run());
    let (tx, rx) = mpsc::channel();

    let armed = tx.clone();
    handle
        .timer_once(
            Duration::from_millis(50),
            Box::new(move |_| armed.send("fired").unwrap()),
        )
        .unwrap();

    let cancelled = tx.clone();
    let h = handle
        .timer_once(
            Duration::from_millis(50),
            Box::new(move |_| {
                let _ = cancelled.send("cancelled-fired");
            }),
        )
        .unwrap();
    handle.cancel(h);

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "fired");
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    handle.shutdown();
    loop_thread.join().unwrap();
}

#[test]
fn read_timeout_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // server accepts and stays silent
    let server = thread::spawn(move || {
        let (sock, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_millis(500));
        drop(sock);
    });

    let (mut evloop, handle) = EventLoop::new().unwrap();
    let loop_thread = thread::spawn(move || evloop.run());

    let (tx, rx) = mpsc::channel();
    struct Quiet {
        tx: mpsc::Sender<String>,
    }
    impl Session for Quiet {
        fn on_event(&mut self, _io: &mut Io<'_>, ev: ConnEvent) -> Flow {
            match ev {
                ConnEvent::Connected => Flow::Continue,
                ConnEvent::ReadTimeout => {
                    self.tx.send("read-timeout".into()).unwrap();
                    Flow::Close
                }
                _ => Flow::Close,
            }
        }
        fn on_readable(&mut self, _io: &mut Io<'_>) -> Flow {
            Flow::Continue
        }
    }

    handle
        .connect(
            ConnectParams {
                host: "127.0.0.1".into(),
                port: addr.port(),
                tls: false,
                read_timeout: Some(Duration::from_millis(100)),
                write_timeout: None,
            },
            Box::new(Quiet { tx }),
        )
        .unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "read-timeout");

    server.join().unwrap();
    handle.shutdown();
    loop_thread.join().unwrap();
}
