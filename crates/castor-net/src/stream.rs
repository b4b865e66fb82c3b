use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    time::Instant,
};

use bytes::Bytes;
use mio::{Interest, Registry, Token, net::TcpStream};
use tracing::{debug, warn};

use crate::NetError;

/// Response type for all write/flush calls.
///
/// `Alive` means the connection is still usable.
/// `Disconnected` means the peer is gone and the connection must be
/// torn down.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum ConnState {
    Alive,
    Disconnected,
}

/// Outcome of one socket-level read pass.
pub(crate) enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Eof,
    Failed(NetError),
}

/// Single outbound connection, plain TCP or TLS.
///
/// Outbound bytes are refcounted `Bytes` segments: whatever the kernel
/// does not accept immediately is backlogged and flushed on writable
/// events. WRITABLE interest is armed only while output is stuck.
///
/// The TLS variant owns a `rustls::ClientConnection`; plaintext moves
/// through `reader()`/`writer()` while the same readable/writable
/// events pump ciphertext with `read_tls`/`write_tls`.
pub(crate) struct NetStream {
    tcp: TcpStream,
    tls: Option<Box<rustls::ClientConnection>>,
    backlog: VecDeque<Bytes>,
    /// True if WRITABLE interest is currently registered.
    writable_armed: bool,
    connected: bool,
    tcp_eof: bool,
    /// Set while output is stuck waiting for the kernel.
    blocked_since: Option<Instant>,
}

impl NetStream {
    /// Takes ownership of a connecting socket. The socket must already
    /// be registered with READABLE | WRITABLE interest; the connect
    /// completion arrives as the first writable event.
    pub fn new(tcp: TcpStream, tls: Option<Box<rustls::ClientConnection>>) -> Self {
        Self {
            tcp,
            tls,
            backlog: VecDeque::new(),
            writable_armed: true,
            connected: false,
            tcp_eof: false,
            blocked_since: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn blocked_since(&self) -> Option<Instant> {
        self.blocked_since
    }

    /// Checks whether the non-blocking connect finished. `Ok(true)`
    /// exactly once; `Ok(false)` for spurious wakeups while still in
    /// progress.
    pub fn finish_connect(&mut self) -> Result<bool, NetError> {
        if let Some(err) = self.tcp.take_error()? {
            return Err(err.into());
        }
        match self.tcp.peer_addr() {
            Ok(_) => {
                self.connected = true;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads once into `buf`, decrypting when TLS is active.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> ReadOutcome {
        match &mut self.tls {
            None => match self.tcp.read(buf) {
                Ok(0) => ReadOutcome::Eof,
                Ok(n) => ReadOutcome::Data(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::WouldBlock,
                Err(e) => ReadOutcome::Failed(e.into()),
            },
            Some(tls) => {
                // pump ciphertext from the socket into rustls
                while !self.tcp_eof {
                    match tls.read_tls(&mut self.tcp) {
                        Ok(0) => self.tcp_eof = true,
                        Ok(_) => {
                            if let Err(e) = tls.process_new_packets() {
                                return ReadOutcome::Failed(e.into());
                            }
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return ReadOutcome::Failed(e.into()),
                    }
                }
                match tls.reader().read(buf) {
                    Ok(0) => ReadOutcome::Eof,
                    Ok(n) => ReadOutcome::Data(n),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if self.tcp_eof { ReadOutcome::Eof } else { ReadOutcome::WouldBlock }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => ReadOutcome::Eof,
                    Err(e) => ReadOutcome::Failed(e.into()),
                }
            }
        }
    }

    /// Queues `data` and flushes as much as the kernel accepts.
    pub fn write(&mut self, registry: &Registry, token: Token, data: Bytes) -> ConnState {
        if data.is_empty() {
            return ConnState::Alive;
        }
        self.backlog.push_back(data);
        self.flush(registry, token)
    }

    /// Flushes backlogged output until the kernel blocks or the queue
    /// empties, then arms or disarms WRITABLE interest accordingly.
    pub fn flush(&mut self, registry: &Registry, token: Token) -> ConnState {
        if !self.connected {
            return ConnState::Alive;
        }

        let state = if self.tls.is_some() {
            self.flush_tls()
        } else {
            Self::flush_plain(&mut self.tcp, &mut self.backlog)
        };
        if state == ConnState::Disconnected {
            return state;
        }

        if self.has_backpressure() {
            if self.blocked_since.is_none() {
                self.blocked_since = Some(Instant::now());
            }
            self.arm_writable(registry, token)
        } else {
            self.blocked_since = None;
            self.disarm_writable(registry, token)
        }
    }

    fn flush_plain(tcp: &mut TcpStream, backlog: &mut VecDeque<Bytes>) -> ConnState {
        while let Some(front) = backlog.front_mut() {
            match tcp.write(front) {
                Ok(0) => {
                    warn!("stream failed to write, disconnecting");
                    return ConnState::Disconnected;
                }
                Ok(n) => {
                    if n == front.len() {
                        backlog.pop_front();
                    } else {
                        *front = front.slice(n..);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, "stream write failed");
                    return ConnState::Disconnected;
                }
            }
        }
        ConnState::Alive
    }

    fn flush_tls(&mut self) -> ConnState {
        let Some(tls) = self.tls.as_mut() else { return ConnState::Alive };

        // hand plaintext to rustls; it buffers across the handshake
        while let Some(front) = self.backlog.pop_front() {
            if let Err(err) = tls.writer().write_all(&front) {
                debug!(?err, "tls plaintext write failed");
                return ConnState::Disconnected;
            }
        }
        while tls.wants_write() {
            match tls.write_tls(&mut self.tcp) {
                Ok(0) => {
                    warn!("stream failed to write, disconnecting");
                    return ConnState::Disconnected;
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, "tls write failed");
                    return ConnState::Disconnected;
                }
            }
        }
        ConnState::Alive
    }

    fn has_backpressure(&self) -> bool {
        !self.backlog.is_empty() || self.tls.as_ref().is_some_and(|t| t.wants_write())
    }

    fn arm_writable(&mut self, registry: &Registry, token: Token) -> ConnState {
        if !self.writable_armed {
            if let Err(err) =
                registry.reregister(&mut self.tcp, token, Interest::READABLE | Interest::WRITABLE)
            {
                debug!(?err, "poll reregister failed");
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    fn disarm_writable(&mut self, registry: &Registry, token: Token) -> ConnState {
        if self.writable_armed {
            if let Err(err) = registry.reregister(&mut self.tcp, token, Interest::READABLE) {
                debug!(?err, "poll reregister failed");
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }
        ConnState::Alive
    }

    pub fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.tcp);
        let _ = self.tcp.shutdown(std::net::Shutdown::Both);
    }
}
