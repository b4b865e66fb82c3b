use std::{
    sync::{Arc, Mutex, RwLock, Weak},
    time::Duration,
};

use castor_net::{TimerHandle, Token};
use tracing::{error, info};

use crate::{
    Error,
    caster::Caster,
    client::{self, ClientSpec},
    mime::MimeItem,
    mimeq::MimeQueue,
};

/// Verdict of a line callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFlow {
    Continue,
    Stop,
}

/// Callback surface of a task.
///
/// Implementors typically own the `Arc<Task>`; the task side keeps a
/// `Weak` back-reference so the pair stays cycle-free.
pub trait TaskRunner: Send + Sync {
    /// One decoded response line while the connection waits in
    /// callback mode. `Stop` ends the transfer gracefully.
    fn line(&self, task: &Arc<Task>, line: &str) -> LineFlow {
        let _ = (task, line);
        LineFlow::Continue
    }

    /// The parsed HTTP status code, before the machine acts on it.
    fn status(&self, task: &Arc<Task>, code: u16) {
        let _ = (task, code);
    }

    /// The transfer finished; `success` is false on any failure path.
    /// For push tasks a successful cycle keeps the connection: batch
    /// acknowledgement happens right after this returns.
    fn end(&self, task: &Arc<Task>, success: bool);

    /// The refresh timer fired; typically starts a new attempt.
    fn restart(&self, task: &Arc<Task>);
}

/// Connection parameters of a task; `reload` swaps them wholesale.
#[derive(Debug, Clone)]
pub struct TaskParams {
    pub host: String,
    pub port: u16,
    pub uri: String,
    pub tls: bool,
    pub method: String,
    /// Seconds between attempts; 0 makes the task one-shot.
    pub refresh_delay: u64,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// Keep the connection in idle-client mode between pushes.
    pub connection_keepalive: bool,
    /// Drive the mime queue instead of a plain GET exchange.
    pub use_mimeq: bool,
    /// Extra request headers, sent after the fixed set in order.
    pub headers: Vec<(String, String)>,
}

impl TaskParams {
    pub fn new(host: &str, port: u16, uri: &str, tls: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            uri: uri.to_string(),
            tls,
            method: "GET".to_string(),
            refresh_delay: 0,
            read_timeout: None,
            write_timeout: None,
            connection_keepalive: false,
            use_mimeq: false,
            headers: Vec::new(),
        }
    }
}

/// Queue state and the refresh-timer slot share one lock, mirroring
/// the original's mimeq lock discipline.
struct TaskState {
    queue: MimeQueue,
    timer: Option<TimerHandle>,
}

/// A reusable, periodically rescheduled activity bound to at most one
/// live connection at a time.
///
/// Lock ordering: the `st` slot before `state`; neither is held
/// across a scheduler call.
pub struct Task {
    caster: Arc<Caster>,
    kind: &'static str,
    params: RwLock<TaskParams>,
    state: Mutex<TaskState>,
    st: RwLock<Option<Token>>,
    runner: RwLock<Option<Weak<dyn TaskRunner>>>,
}

impl Task {
    /// Constructs stopped; call `start` to open a connection.
    pub fn new(
        caster: Arc<Caster>,
        kind: &'static str,
        params: TaskParams,
        bulk_max_size: usize,
        queue_max_size: usize,
        drainfilename: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            caster,
            kind,
            params: RwLock::new(params),
            state: Mutex::new(TaskState {
                queue: MimeQueue::new(bulk_max_size, queue_max_size, drainfilename),
                timer: None,
            }),
            st: RwLock::new(None),
            runner: RwLock::new(None),
        })
    }

    pub fn set_runner(&self, runner: Weak<dyn TaskRunner>) {
        *self.runner.write().unwrap() = Some(runner);
    }

    fn runner(&self) -> Option<Arc<dyn TaskRunner>> {
        self.runner.read().unwrap().as_ref()?.upgrade()
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn caster(&self) -> &Arc<Caster> {
        &self.caster
    }

    pub fn params(&self) -> TaskParams {
        self.params.read().unwrap().clone()
    }

    pub fn update_params(&self, f: impl FnOnce(&mut TaskParams)) {
        f(&mut self.params.write().unwrap());
    }

    /// Opens a new connection through the client factory; the state
    /// machine binds itself back to the task before any I/O event.
    pub fn start(self: &Arc<Self>) -> Result<Token, Error> {
        let params = self.params();
        let spec = ClientSpec::for_task(self.clone(), &params);
        client::start(&self.caster, spec)
    }

    /// Cancels the refresh timer and tears down any bound connection.
    /// In-flight hand-offs are forgotten, not freed.
    pub fn stop(&self) {
        {
            let p = self.params.read().unwrap();
            info!(kind = self.kind, host = %p.host, port = p.port, "stopping task");
        }
        let timer = {
            let mut state = self.state.lock().unwrap();
            state.queue.reset_pending();
            state.timer.take()
        };
        if let Some(timer) = timer {
            self.caster.sched().cancel(timer);
        }
        let token = self.st.write().unwrap().take();
        if let Some(token) = token {
            self.caster.sched().close(token);
        }
    }

    /// Arms the one-shot refresh timer. With `refresh_delay == 0` the
    /// task stays stopped. A refused timer leaves the task stopped
    /// with a log record.
    pub fn reschedule(self: &Arc<Self>) {
        let params = self.params();
        let old = {
            let mut state = self.state.lock().unwrap();
            state.queue.reset_pending();
            state.timer.take()
        };
        if let Some(old) = old {
            self.caster.sched().cancel(old);
        }
        if params.refresh_delay == 0 {
            return;
        }
        let weak = Arc::downgrade(self);
        let armed = self.caster.sched().timer_once(
            Duration::from_secs(params.refresh_delay),
            Box::new(move |_| {
                if let Some(task) = weak.upgrade() {
                    task.timer_fired();
                }
            }),
        );
        match armed {
            Ok(handle) => {
                self.state.lock().unwrap().timer = Some(handle);
                info!(
                    kind = self.kind,
                    host = %params.host,
                    port = params.port,
                    delay = params.refresh_delay,
                    "refresh scheduled"
                );
            }
            Err(e) => error!(
                kind = self.kind,
                host = %params.host,
                port = params.port,
                error = %e,
                "cannot schedule refresh, canceling"
            ),
        }
    }

    fn timer_fired(self: &Arc<Self>) {
        // the slot is cleared before the restart callback runs
        self.state.lock().unwrap().timer = None;
        if let Some(runner) = self.runner() {
            runner.restart(self);
        }
    }

    /// Stop plus parameter update; restarting is the caller's
    /// responsibility.
    pub fn reload(
        &self,
        params: TaskParams,
        bulk_max_size: usize,
        queue_max_size: usize,
        drainfilename: Option<String>,
    ) {
        self.stop();
        *self.params.write().unwrap() = params;
        self.state.lock().unwrap().queue.reconfigure(bulk_max_size, queue_max_size, drainfilename);
    }

    /// Wraps a JSON payload and queues it for pushing; wakes the
    /// bound connection if it sits idle.
    pub fn queue(&self, json: &str) {
        let outcome = self.state.lock().unwrap().queue.enqueue(MimeItem::json(json.to_string()));
        if let Err(e) = outcome {
            let p = self.params.read().unwrap();
            error!(kind = self.kind, host = %p.host, port = p.port, error = %e, "dropping payload");
            return;
        }
        let token = *self.st.read().unwrap();
        if let Some(token) = token {
            self.caster.sched().kick(token);
        }
    }

    /// Releases exactly the items taken by the last batch. Returns
    /// the bytes freed.
    pub fn ack_pending(&self) -> usize {
        self.state.lock().unwrap().queue.ack_pending()
    }

    pub(crate) fn bind(&self, token: Token) {
        *self.st.write().unwrap() = Some(token);
    }

    pub(crate) fn unbind(&self, token: Token) {
        let mut st = self.st.write().unwrap();
        if *st == Some(token) {
            *st = None;
        }
    }

    pub fn bound(&self) -> Option<Token> {
        *self.st.read().unwrap()
    }

    /// Runs `f` under the queue lock; the state machine plans and
    /// marks batches atomically through this.
    pub(crate) fn with_queue<R>(&self, f: impl FnOnce(&mut MimeQueue) -> R) -> R {
        f(&mut self.state.lock().unwrap().queue)
    }

    pub(crate) fn notify_end(self: &Arc<Self>, success: bool) {
        if let Some(runner) = self.runner() {
            runner.end(self, success);
        }
    }

    pub(crate) fn notify_status(self: &Arc<Self>, code: u16) {
        if let Some(runner) = self.runner() {
            runner.status(self, code);
        }
    }

    pub(crate) fn notify_line(self: &Arc<Self>, line: &str) -> LineFlow {
        self.runner().map_or(LineFlow::Stop, |runner| runner.line(self, line))
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().queue.pending()
    }

    pub fn queue_size(&self) -> usize {
        self.state.lock().unwrap().queue.queue_size()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        // whatever is still queued goes to the drain file
        if let Ok(mut state) = self.state.lock() {
            state.queue.reset_pending();
            state.queue.drain();
        }
    }
}
