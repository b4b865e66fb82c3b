use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use castor_net::{ConnEvent, ConnectParams, Flow, Io, NetError, SchedulerHandle, Session, Token};
use tracing::{debug, info, warn};

use crate::{
    Error,
    caster::Caster,
    livesource::{Livesource, LivesourceState},
    request::{BodyMeta, build_request},
    task::{LineFlow, Task, TaskParams},
};

/// Connection states of the client machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    WaitHttpStatus,
    WaitHttpHeader,
    RegisterSource,
    WaitStreamGet,
    WaitCallbackLine,
    /// Push connection waiting for the next batch.
    IdleClient,
    WaitClose,
    ForceClose,
    End,
}

/// What to open and how to drive it.
pub struct ClientSpec {
    pub host: String,
    pub port: u16,
    pub uri: String,
    pub tls: bool,
    /// Label for logs (`sourcetable_fetcher`, `sender`, ...).
    pub kind: &'static str,
    pub task: Option<Arc<Task>>,
    /// Non-empty when pulling a mountpoint stream.
    pub mountpoint: String,
    pub persistent: bool,
    pub redistribute: bool,
    pub livesource: Option<Arc<Livesource>>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl ClientSpec {
    /// A task-driven client: no mountpoint, no livesource.
    pub fn for_task(task: Arc<Task>, params: &TaskParams) -> Self {
        Self {
            host: params.host.clone(),
            port: params.port,
            uri: params.uri.clone(),
            tls: params.tls,
            kind: task.kind(),
            mountpoint: String::new(),
            persistent: false,
            redistribute: false,
            livesource: None,
            read_timeout: params.read_timeout,
            write_timeout: params.write_timeout,
            task: Some(task),
        }
    }

    /// A mountpoint pull client feeding a livesource.
    pub fn for_mountpoint(
        host: &str,
        port: u16,
        tls: bool,
        mountpoint: &str,
        livesource: Arc<Livesource>,
        persistent: bool,
        redistribute: bool,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            uri: format!("/{mountpoint}"),
            tls,
            kind: "source_fetcher",
            task: None,
            mountpoint: mountpoint.to_string(),
            persistent,
            redistribute,
            livesource: Some(livesource),
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// Opens the outbound connection and installs the state machine.
pub fn start(caster: &Arc<Caster>, spec: ClientSpec) -> Result<Token, Error> {
    let params = ConnectParams {
        host: spec.host.clone(),
        port: spec.port,
        tls: spec.tls,
        read_timeout: spec.read_timeout.or(Some(caster.config().fetch_timeout())),
        write_timeout: spec.write_timeout.or(Some(caster.config().fetch_timeout())),
    };
    info!(kind = spec.kind, host = %spec.host, port = spec.port, "starting client");
    let session = Box::new(NtripClient::new(caster.clone(), spec));
    Ok(caster.sched().connect(params, session)?)
}

/// Per-connection state machine: connect, request, status and header
/// parse, then stream relay, line callbacks, or the idle push cycle.
pub struct NtripClient {
    caster: Arc<Caster>,
    task: Option<Arc<Task>>,
    host: String,
    port: u16,
    uri: String,
    kind: &'static str,
    mountpoint: String,
    persistent: bool,
    redistribute: bool,
    own_livesource: Option<Arc<Livesource>>,
    state: ClientState,
    http_args: Vec<String>,
    status_code: u16,
    chunked: bool,
    received_bytes: u64,
    sent_bytes: u64,
    start: Instant,
    last_data: Instant,
    method: String,
    headers: Vec<(String, String)>,
    use_mimeq: bool,
    keepalive: bool,
}

impl NtripClient {
    fn new(caster: Arc<Caster>, spec: ClientSpec) -> Self {
        let (method, headers, use_mimeq, keepalive) = match &spec.task {
            Some(task) => {
                let p = task.params();
                (p.method, p.headers, p.use_mimeq, p.connection_keepalive)
            }
            None => ("GET".to_string(), Vec::new(), false, false),
        };
        Self {
            caster,
            task: spec.task,
            host: spec.host,
            port: spec.port,
            uri: spec.uri,
            kind: spec.kind,
            mountpoint: spec.mountpoint,
            persistent: spec.persistent,
            redistribute: spec.redistribute,
            own_livesource: spec.livesource,
            state: ClientState::Connecting,
            http_args: Vec::new(),
            status_code: 0,
            chunked: false,
            received_bytes: 0,
            sent_bytes: 0,
            start: Instant::now(),
            last_data: Instant::now(),
            method,
            headers,
            use_mimeq,
            keepalive,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    fn send_request(&mut self, io: &mut Io<'_>, body: Option<BodyMeta<'_>>) -> Result<(), Error> {
        let head = build_request(
            &self.method,
            &self.host,
            self.port,
            &self.uri,
            2,
            self.caster.credentials(),
            &self.headers,
            body,
        )?;
        self.sent_bytes += head.len() as u64;
        io.write(head);
        Ok(())
    }

    /// Pulls the next batch out of the task's queue and emits one
    /// request for it; items go out by reference, in order. Only legal
    /// in `IdleClient` with nothing pending.
    fn pump_queue(&mut self, io: &mut Io<'_>) -> Flow {
        debug_assert_eq!(self.state, ClientState::IdleClient);
        let Some(task) = self.task.clone() else { return Flow::Continue };

        let planned = task.with_queue(|q| {
            debug_assert_eq!(q.pending(), 0);
            let batch = q.next_batch()?;
            let bulk = q.is_bulk();
            let content_type = if bulk {
                q.bulk_content_type().to_string()
            } else {
                q.head(1).next().map(|m| m.mime_type().to_string()).unwrap_or_default()
            };
            let items: Vec<Bytes> = q.head(batch.count).map(|m| m.data().clone()).collect();
            q.note_pending(batch.count);
            Some((batch, bulk, content_type, items))
        });

        let Some((batch, bulk, content_type, items)) = planned else {
            if !self.keepalive {
                self.finish(io, true, true);
                return Flow::Close;
            }
            return Flow::Continue;
        };

        let body = BodyMeta { len: batch.total, content_type: &content_type };
        if let Err(e) = self.send_request(io, Some(body)) {
            warn!(host = %self.host, port = self.port, error = %e, "cannot build push request, dropping connection");
            self.finish(io, false, true);
            return Flow::Close;
        }
        for data in items {
            self.sent_bytes += data.len() as u64;
            io.write(data);
            if bulk {
                io.write(Bytes::from_static(b"\n"));
                self.sent_bytes += 1;
            }
        }
        self.state = ClientState::WaitHttpStatus;
        Flow::Continue
    }

    /// Terminal bookkeeping: livesource hand-off or unregistration,
    /// task unbinding with at most one end notification, close log.
    fn finish(&mut self, io: &mut Io<'_>, success: bool, notify: bool) {
        if self.state == ClientState::End {
            return;
        }
        self.state = ClientState::WaitClose;

        if let Some(livesource) = self.own_livesource.take() {
            if self.redistribute && self.persistent {
                livesource.set_state(LivesourceState::FetchPending);
                let caster = self.caster.clone();
                let mountpoint = self.mountpoint.clone();
                let delay = self.caster.config().reconnect();
                info!(mountpoint = %self.mountpoint, ?delay, "scheduling redistribute reconnect");
                let _ = io
                    .sched()
                    .timer_once(delay, Box::new(move |_| caster.fire_redistribute(&mountpoint)));
            } else {
                self.caster.livesources().unregister(livesource.mountpoint());
            }
        }

        if let Some(task) = self.task.take() {
            task.unbind(io.token());
            if notify {
                task.notify_end(success);
            }
        }

        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        info!(
            host = %self.host,
            port = self.port,
            uri = %self.uri,
            kind = self.kind,
            status = self.status_code,
            received = self.received_bytes,
            sent = self.sent_bytes,
            elapsed_ms,
            bytes_left = io.input_len(),
            "connection closed"
        );
        self.state = ClientState::End;
    }
}

fn parse_header(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    Some((key.trim(), value.trim()))
}

impl Session for NtripClient {
    fn on_start(&mut self, io: &mut Io<'_>) {
        if let Some(task) = &self.task {
            task.bind(io.token());
        }
    }

    fn on_failed(&mut self, _sched: &SchedulerHandle, err: &NetError) {
        warn!(host = %self.host, port = self.port, uri = %self.uri, kind = self.kind, error = %err, "connect failed");
        if let Some(task) = self.task.take() {
            task.notify_end(false);
        }
        if let Some(livesource) = self.own_livesource.take() {
            self.caster.livesources().unregister(livesource.mountpoint());
        }
    }

    fn on_event(&mut self, io: &mut Io<'_>, ev: ConnEvent) -> Flow {
        match ev {
            ConnEvent::Connected => {
                info!(host = %self.host, port = self.port, uri = %self.uri, kind = self.kind, "connected");
                if self.use_mimeq {
                    self.state = ClientState::IdleClient;
                    return self.pump_queue(io);
                }
                match self.send_request(io, None) {
                    Ok(()) => {
                        self.state = ClientState::WaitHttpStatus;
                        Flow::Continue
                    }
                    Err(e) => {
                        warn!(host = %self.host, port = self.port, error = %e, "cannot build request, dropping connection");
                        self.finish(io, false, true);
                        Flow::Close
                    }
                }
            }
            ConnEvent::Eof => {
                info!(host = %self.host, port = self.port, kind = self.kind, "server EOF");
                self.finish(io, false, true);
                Flow::Close
            }
            ConnEvent::Error(e) => {
                warn!(host = %self.host, port = self.port, uri = %self.uri, kind = self.kind, error = %Error::from(e), "connection error");
                self.finish(io, false, true);
                Flow::Close
            }
            ConnEvent::ReadTimeout => {
                warn!(host = %self.host, port = self.port, kind = self.kind, error = %Error::ReadTimeout, "dropping connection");
                self.finish(io, false, true);
                Flow::Close
            }
            ConnEvent::WriteTimeout => {
                warn!(host = %self.host, port = self.port, kind = self.kind, error = %Error::WriteTimeout, "dropping connection");
                self.finish(io, false, true);
                Flow::Close
            }
            ConnEvent::Shutdown => {
                // locally requested stop: no end notification
                self.state = ClientState::ForceClose;
                self.finish(io, false, false);
                Flow::Close
            }
        }
    }

    fn on_readable(&mut self, io: &mut Io<'_>) -> Flow {
        let mut end: Option<bool> = None;
        while end.is_none() {
            match self.state {
                ClientState::WaitHttpStatus => {
                    let Some(line) = io.read_line() else { break };
                    debug!(line = %line, uri = %self.uri, "status line");
                    self.http_args = line.split_whitespace().map(str::to_string).collect();
                    let first = self.http_args.first().map_or("", String::as_str);
                    if first == "ERROR" {
                        // NTRIP1 negative reply
                        warn!(line = %line, host = %self.host, port = self.port, "NTRIP1 error reply");
                        end = Some(false);
                        break;
                    }
                    let status = self.http_args.get(1).map_or("", String::as_str);
                    if status.len() != 3 || !status.bytes().all(|b| b.is_ascii_digit()) {
                        warn!(line = %line, error = %Error::Protocol("malformed status line"), "dropping connection");
                        end = Some(false);
                        break;
                    }
                    let code: u16 = status.parse().unwrap_or(0);
                    self.status_code = code;
                    if let Some(task) = &self.task {
                        task.notify_status(code);
                    }
                    if first == "ICY" && code == 200 && !self.mountpoint.is_empty() {
                        // NTRIP1 preamble, no headers follow
                        self.state = ClientState::RegisterSource;
                        io.set_read_timeout(Some(self.caster.config().source_timeout()));
                    } else if code == 200 {
                        self.state = ClientState::WaitHttpHeader;
                    } else {
                        warn!(uri = %self.uri, host = %self.host, port = self.port, error = %Error::HttpStatus(code), "request failed");
                        end = Some(false);
                    }
                }
                ClientState::WaitHttpHeader => {
                    let Some(line) = io.read_line() else { break };
                    if line.is_empty() {
                        debug!("end of headers");
                        if self.chunked && io.set_chunked().is_err() {
                            end = Some(false);
                            break;
                        }
                        if !self.mountpoint.is_empty() {
                            self.state = ClientState::RegisterSource;
                            io.set_read_timeout(Some(self.caster.config().source_timeout()));
                        } else if self.use_mimeq {
                            // response accepted: release the batch,
                            // then pull more
                            if let Some(task) = self.task.clone() {
                                task.notify_end(true);
                                let released = task.ack_pending();
                                debug!(released, "push acknowledged");
                            }
                            self.state = ClientState::IdleClient;
                            if self.pump_queue(io) == Flow::Close {
                                return Flow::Close;
                            }
                        } else if self.task.is_some() {
                            self.state = ClientState::WaitCallbackLine;
                        } else {
                            end = Some(false);
                        }
                    } else {
                        debug!(line = %line, "response header");
                        let Some((key, value)) = parse_header(&line) else {
                            warn!(line = %line, error = %Error::Protocol("malformed header"), "dropping connection");
                            end = Some(false);
                            break;
                        };
                        if key.eq_ignore_ascii_case("transfer-encoding")
                            && value.eq_ignore_ascii_case("chunked")
                        {
                            self.chunked = true;
                        }
                    }
                }
                ClientState::WaitCallbackLine => {
                    let Some(line) = io.read_line() else { break };
                    // count the stripped line terminator too
                    self.received_bytes += line.len() as u64 + 1;
                    let flow =
                        self.task.clone().map_or(LineFlow::Stop, |task| task.notify_line(&line));
                    if flow == LineFlow::Stop {
                        end = Some(true);
                    }
                }
                ClientState::RegisterSource => {
                    if let Some(livesource) = &self.own_livesource {
                        livesource.set_state(LivesourceState::Running);
                        info!(mountpoint = %self.mountpoint, "starting redistribute");
                    }
                    self.state = ClientState::WaitStreamGet;
                }
                ClientState::WaitStreamGet => {
                    let data = io.take_input();
                    if data.is_empty() {
                        if !self.persistent {
                            let idle = self.last_data.elapsed().as_secs();
                            if idle > self.caster.config().idle_max_delay {
                                warn!(mountpoint = %self.mountpoint, idle, "stream idle, dropping");
                                end = Some(false);
                            }
                        }
                        break;
                    }
                    self.received_bytes += data.len() as u64;
                    self.last_data = Instant::now();
                    if let Some(livesource) = &self.own_livesource {
                        livesource.feed(&data);
                    }
                }
                ClientState::IdleClient => {
                    // response bytes between pushes carry nothing we use
                    let Some(line) = io.read_line() else { break };
                    debug!(line = %line, "ignoring response data while idle");
                }
                ClientState::Connecting
                | ClientState::WaitClose
                | ClientState::ForceClose
                | ClientState::End => break,
            }
        }
        if end.is_none() && self.state == ClientState::ForceClose {
            end = Some(false);
        }
        match end {
            None => Flow::Continue,
            Some(success) => {
                self.finish(io, success, true);
                Flow::Close
            }
        }
    }

    fn on_idle_kick(&mut self, io: &mut Io<'_>) -> Flow {
        if self.state == ClientState::IdleClient { self.pump_queue(io) } else { Flow::Continue }
    }
}
