use std::{
    io,
    net::ToSocketAddrs,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
        mpsc,
    },
    time::{Duration, Instant},
};

use mio::{Events, Interest, Poll, Token, Waker, event::Event, net::TcpStream};
use tracing::{debug, error, warn};

use crate::{
    NetError,
    filter::InputFilter,
    session::{ConnEvent, Flow, Io, IoTimeouts, Session},
    stream::{ConnState, NetStream, ReadOutcome},
    timer::{TimerCallback, TimerHandle, TimerQueue},
};

const WAKER: Token = Token(0);
const FIRST_CONN_TOKEN: usize = 1;
const READ_CHUNK: usize = 16 * 1024;

/// Parameters for one outbound client connection.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

enum Command {
    Connect { token: Token, params: ConnectParams, session: Box<dyn Session> },
    TimerOnce { id: u64, deadline: Instant, cb: TimerCallback },
    CancelTimer { id: u64 },
    Kick { token: Token },
    Close { token: Token },
    Shutdown,
}

/// Cloneable, thread-safe handle to the event loop.
///
/// Everything goes through a command channel plus a waker, so no lock
/// is ever held across a call into the loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
    waker: Arc<Waker>,
    next_timer: Arc<AtomicU64>,
    next_conn: Arc<AtomicUsize>,
}

impl SchedulerHandle {
    fn send(&self, cmd: Command) -> Result<(), NetError> {
        self.tx.send(cmd).map_err(|_| NetError::SchedulerGone)?;
        self.waker.wake()?;
        Ok(())
    }

    /// Starts an outbound connection driven by `session`. The returned
    /// token identifies the connection for `kick`/`close`.
    pub fn connect(
        &self,
        params: ConnectParams,
        session: Box<dyn Session>,
    ) -> Result<Token, NetError> {
        let token = Token(self.next_conn.fetch_add(1, Ordering::Relaxed));
        self.send(Command::Connect { token, params, session })?;
        Ok(token)
    }

    /// Arms a one-shot timer. The callback runs on the loop thread.
    pub fn timer_once(
        &self,
        delay: Duration,
        cb: TimerCallback,
    ) -> Result<TimerHandle, NetError> {
        let id = self.next_timer.fetch_add(1, Ordering::Relaxed);
        self.send(Command::TimerOnce { id, deadline: Instant::now() + delay, cb })?;
        Ok(TimerHandle { id })
    }

    pub fn cancel(&self, handle: TimerHandle) {
        let _ = self.send(Command::CancelTimer { id: handle.id });
    }

    /// Notifies an idle connection that new payloads may be queued.
    pub fn kick(&self, token: Token) {
        let _ = self.send(Command::Kick { token });
    }

    /// Requests a deferred teardown; the session sees `Shutdown` first.
    pub fn close(&self, token: Token) {
        let _ = self.send(Command::Close { token });
    }

    pub fn shutdown(&self) {
        let _ = self.send(Command::Shutdown);
    }
}

struct ConnIo {
    stream: NetStream,
    filter: InputFilter,
    timeouts: IoTimeouts,
    last_read: Instant,
    peer: String,
}

struct Conn {
    token: Token,
    io: ConnIo,
    session: Box<dyn Session>,
}

/// Builds an `Io` over one connection's parts and runs `f` on its
/// session. Returns the callback result and whether a write broke the
/// connection mid-callback.
fn with_io<R>(
    conns: &mut [Conn],
    i: usize,
    registry: &mio::Registry,
    sched: &SchedulerHandle,
    f: impl FnOnce(&mut Box<dyn Session>, &mut Io<'_>) -> R,
) -> (R, bool) {
    let Conn { token, io: cio, session } = &mut conns[i];
    let mut io = Io {
        token: *token,
        registry,
        stream: &mut cio.stream,
        filter: &mut cio.filter,
        timeouts: &mut cio.timeouts,
        sched,
        broken: false,
    };
    let r = f(session, &mut io);
    let broken = io.broken;
    (r, broken)
}

struct Core {
    poll: Poll,
    conns: Vec<Conn>,
    timers: TimerQueue,
    rx: mpsc::Receiver<Command>,
    handle: SchedulerHandle,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    running: bool,
}

impl Core {
    fn position(&self, token: Token) -> Option<usize> {
        self.conns.iter().position(|c| c.token == token)
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                Command::Connect { token, params, session } => {
                    self.start_connect(token, params, session);
                }
                Command::TimerOnce { id, deadline, cb } => self.timers.arm(id, deadline, cb),
                Command::CancelTimer { id } => self.timers.cancel(id),
                Command::Kick { token } => self.kick(token),
                Command::Close { token } => self.close_conn(token),
                Command::Shutdown => self.running = false,
            }
        }
    }

    fn start_connect(&mut self, token: Token, params: ConnectParams, mut session: Box<dyn Session>) {
        match self.open_stream(token, &params) {
            Ok(stream) => {
                let peer = format!("{}:{}", params.host, params.port);
                self.conns.push(Conn {
                    token,
                    io: ConnIo {
                        stream,
                        filter: InputFilter::new(),
                        timeouts: IoTimeouts {
                            read: params.read_timeout,
                            write: params.write_timeout,
                        },
                        last_read: Instant::now(),
                        peer,
                    },
                    session,
                });
                let i = self.conns.len() - 1;
                self.dispatch_start(i);
            }
            Err(e) => {
                warn!(host = %params.host, port = params.port, error = %e, "connect setup failed");
                session.on_failed(&self.handle, &e);
            }
        }
    }

    fn open_stream(&mut self, token: Token, params: &ConnectParams) -> Result<NetStream, NetError> {
        let addr = (params.host.as_str(), params.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| NetError::Resolve(params.host.clone()))?;
        let tls = if params.tls { Some(self.tls_client(&params.host)?) } else { None };
        let mut tcp = TcpStream::connect(addr)?;
        self.poll
            .registry()
            .register(&mut tcp, token, Interest::READABLE | Interest::WRITABLE)?;
        Ok(NetStream::new(tcp, tls))
    }

    fn tls_client(&mut self, host: &str) -> Result<Box<rustls::ClientConnection>, NetError> {
        let config = self
            .tls_config
            .get_or_insert_with(|| {
                let roots = rustls::RootCertStore::from_iter(
                    webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
                );
                Arc::new(
                    rustls::ClientConfig::builder()
                        .with_root_certificates(roots)
                        .with_no_client_auth(),
                )
            })
            .clone();
        // SNI and certificate verification both use the configured host
        let name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|_| NetError::ServerName(host.to_string()))?;
        let mut conn = rustls::ClientConnection::new(config, name)?;
        conn.set_buffer_limit(None);
        Ok(Box::new(conn))
    }

    fn dispatch_start(&mut self, i: usize) {
        let Self { conns, poll, handle, .. } = self;
        let (_, broken) = with_io(conns, i, poll.registry(), handle, |s, io| s.on_start(io));
        if broken {
            self.teardown(i);
        }
    }

    fn dispatch_event(&mut self, i: usize, ev: ConnEvent) -> Flow {
        let Self { conns, poll, handle, .. } = self;
        let (flow, broken) = with_io(conns, i, poll.registry(), handle, |s, io| s.on_event(io, ev));
        if broken { Flow::Close } else { flow }
    }

    fn dispatch_readable(&mut self, i: usize) -> Flow {
        let Self { conns, poll, handle, .. } = self;
        let (flow, broken) = with_io(conns, i, poll.registry(), handle, |s, io| s.on_readable(io));
        if broken { Flow::Close } else { flow }
    }

    fn dispatch_kick(&mut self, i: usize) -> Flow {
        let Self { conns, poll, handle, .. } = self;
        let (flow, broken) = with_io(conns, i, poll.registry(), handle, |s, io| s.on_idle_kick(io));
        if broken { Flow::Close } else { flow }
    }

    fn conn_event(&mut self, ev: &Event) {
        let token = ev.token();
        let Some(i) = self.position(token) else {
            debug!(?token, "event for unknown token");
            return;
        };

        if !self.conns[i].io.stream.is_connected() {
            match self.conns[i].io.stream.finish_connect() {
                Ok(true) => {
                    self.conns[i].io.last_read = Instant::now();
                    debug!(peer = %self.conns[i].io.peer, "connected");
                    if self.dispatch_event(i, ConnEvent::Connected) == Flow::Close {
                        self.teardown(i);
                        return;
                    }
                    if !self.flush_conn(i) {
                        return;
                    }
                }
                Ok(false) => return,
                Err(e) => {
                    self.dispatch_event(i, ConnEvent::Error(e));
                    self.teardown(i);
                    return;
                }
            }
        }

        if ev.is_readable() && !self.read_pass(i) {
            return;
        }
        if ev.is_writable() {
            self.flush_conn(i);
        }
    }

    /// Drains the socket, feeds the filter, and hands input to the
    /// session. Returns false if the connection was torn down.
    fn read_pass(&mut self, i: usize) -> bool {
        let mut buf = [0u8; READ_CHUNK];
        let mut eof = false;
        let mut failure: Option<NetError> = None;

        loop {
            let cio = &mut self.conns[i].io;
            match cio.stream.read_chunk(&mut buf) {
                ReadOutcome::Data(n) => {
                    cio.last_read = Instant::now();
                    if let Err(e) = cio.filter.feed(&buf[..n]) {
                        failure = Some(e);
                        break;
                    }
                }
                ReadOutcome::WouldBlock => break,
                ReadOutcome::Eof => {
                    eof = true;
                    break;
                }
                ReadOutcome::Failed(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        // buffered input goes to the session before EOF or errors are
        // reported
        if self.conns[i].io.filter.len() > 0 && self.dispatch_readable(i) == Flow::Close {
            self.teardown(i);
            return false;
        }
        if let Some(e) = failure {
            self.dispatch_event(i, ConnEvent::Error(e));
            self.teardown(i);
            return false;
        }
        if eof {
            self.dispatch_event(i, ConnEvent::Eof);
            self.teardown(i);
            return false;
        }
        self.flush_conn(i)
    }

    /// Flushes pending output; tears down on write failure. Returns
    /// false if the connection is gone.
    fn flush_conn(&mut self, i: usize) -> bool {
        let Self { conns, poll, .. } = self;
        let conn = &mut conns[i];
        if conn.io.stream.flush(poll.registry(), conn.token) == ConnState::Disconnected {
            self.dispatch_event(i, ConnEvent::Error(NetError::Io(io::ErrorKind::BrokenPipe.into())));
            self.teardown(i);
            return false;
        }
        true
    }

    fn kick(&mut self, token: Token) {
        let Some(i) = self.position(token) else { return };
        if !self.conns[i].io.stream.is_connected() {
            return;
        }
        if self.dispatch_kick(i) == Flow::Close {
            self.teardown(i);
            return;
        }
        self.flush_conn(i);
    }

    fn close_conn(&mut self, token: Token) {
        let Some(i) = self.position(token) else { return };
        self.dispatch_event(i, ConnEvent::Shutdown);
        self.teardown(i);
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        let Self { timers, handle, .. } = self;
        while let Some(entry) = timers.pop_due(now) {
            (entry.cb)(handle);
        }
    }

    fn check_deadlines(&mut self) {
        let now = Instant::now();
        let mut i = self.conns.len();
        while i != 0 {
            i -= 1;
            let cio = &self.conns[i].io;
            let read_expired =
                cio.timeouts.read.is_some_and(|t| now.duration_since(cio.last_read) > t);
            let write_expired = cio
                .stream
                .blocked_since()
                .zip(cio.timeouts.write)
                .is_some_and(|(since, t)| now.duration_since(since) > t);
            if read_expired {
                self.dispatch_event(i, ConnEvent::ReadTimeout);
                self.teardown(i);
            } else if write_expired {
                self.dispatch_event(i, ConnEvent::WriteTimeout);
                self.teardown(i);
            }
        }
    }

    fn next_wakeup(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let mut next = self.timers.next_deadline();
        for conn in &self.conns {
            let cio = &conn.io;
            if let Some(t) = cio.timeouts.read {
                let d = cio.last_read + t;
                next = Some(next.map_or(d, |n| n.min(d)));
            }
            if let (Some(since), Some(t)) = (cio.stream.blocked_since(), cio.timeouts.write) {
                let d = since + t;
                next = Some(next.map_or(d, |n| n.min(d)));
            }
        }
        next.map(|d| d.saturating_duration_since(now))
    }

    fn teardown(&mut self, i: usize) {
        let mut conn = self.conns.swap_remove(i);
        debug!(peer = %conn.io.peer, "connection released");
        conn.io.stream.close(self.poll.registry());
    }

    fn shutdown_all(&mut self) {
        while !self.conns.is_empty() {
            let last = self.conns.len() - 1;
            self.dispatch_event(last, ConnEvent::Shutdown);
            self.teardown(last);
        }
    }
}

/// Single-threaded event loop: sockets, one-shot timers, and the
/// command channel behind [`SchedulerHandle`].
pub struct EventLoop {
    events: Events,
    core: Core,
}

impl EventLoop {
    pub fn new() -> io::Result<(Self, SchedulerHandle)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (tx, rx) = mpsc::channel();
        let handle = SchedulerHandle {
            tx,
            waker,
            next_timer: Arc::new(AtomicU64::new(1)),
            next_conn: Arc::new(AtomicUsize::new(FIRST_CONN_TOKEN)),
        };
        let core = Core {
            poll,
            conns: Vec::new(),
            timers: TimerQueue::new(),
            rx,
            handle: handle.clone(),
            tls_config: None,
            running: true,
        };
        Ok((Self { events: Events::with_capacity(128), core }, handle))
    }

    /// Runs until [`SchedulerHandle::shutdown`] is called. Remaining
    /// connections get a `Shutdown` event on exit.
    pub fn run(&mut self) {
        while self.core.running {
            let timeout = self.core.next_wakeup();
            if let Err(e) = self.core.poll.poll(&mut self.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed");
                break;
            }
            for ev in self.events.iter() {
                if ev.token() != WAKER {
                    self.core.conn_event(ev);
                }
            }
            self.core.drain_commands();
            self.core.fire_timers();
            self.core.check_deadlines();
        }
        self.core.shutdown_all();
    }
}
