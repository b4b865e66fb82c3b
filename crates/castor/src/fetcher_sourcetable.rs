use std::{
    sync::{Arc, Mutex, Weak},
    time::Instant,
};

use castor_net::Token;
use tracing::{info, warn};

use crate::{
    Error,
    caster::Caster,
    sourcetable::Sourcetable,
    task::{LineFlow, Task, TaskParams, TaskRunner},
};

/// Terminates a sourcetable body.
const END_SENTINEL: &str = "ENDSOURCETABLE";

struct FetchState {
    /// Table under construction during an attempt.
    sourcetable: Option<Sourcetable>,
    started: Option<Instant>,
    priority: i32,
    /// Set across a reload so the installed table survives the
    /// stop/start transition.
    keep_sourcetable: bool,
}

/// Task specialization that periodically downloads a sourcetable and
/// installs it into the caster's stack under its priority.
pub struct SourcetableFetcher {
    task: Arc<Task>,
    caster: Arc<Caster>,
    state: Mutex<FetchState>,
}

impl SourcetableFetcher {
    /// Constructs stopped; call `start` for the first attempt.
    pub fn new(
        caster: &Arc<Caster>,
        host: &str,
        port: u16,
        tls: bool,
        refresh_delay: u64,
        priority: i32,
    ) -> Arc<Self> {
        let mut params = TaskParams::new(host, port, "/", tls);
        params.refresh_delay = refresh_delay;
        params.read_timeout = Some(caster.config().fetch_timeout());
        params.write_timeout = Some(caster.config().fetch_timeout());
        let task = Task::new(caster.clone(), "sourcetable_fetcher", params, 0, 0, None);

        let fetcher = Arc::new(Self {
            task,
            caster: caster.clone(),
            state: Mutex::new(FetchState {
                sourcetable: None,
                started: None,
                priority,
                keep_sourcetable: false,
            }),
        });
        let runner: Weak<dyn TaskRunner> = Arc::downgrade(&(fetcher.clone() as Arc<dyn TaskRunner>));
        fetcher.task.set_runner(runner);
        fetcher
    }

    /// Begins a fetch attempt.
    pub fn start(&self) -> Result<Token, Error> {
        {
            let params = self.task.params();
            let mut state = self.state.lock().unwrap();
            state.sourcetable = Some(Sourcetable::new(&params.host, params.port, params.tls));
            state.started = Some(Instant::now());
        }
        self.task.start()
    }

    fn stop_inner(&self, keep_sourcetable: bool) {
        let params = self.task.params();
        info!(host = %params.host, port = params.port, "stopping sourcetable fetch");
        self.task.stop();
        self.state.lock().unwrap().keep_sourcetable = keep_sourcetable;
        if !keep_sourcetable {
            self.caster.sourcetables().replace_host(&params.host, params.port, None);
        }
    }

    /// Stops the fetcher and clears its stack entry.
    pub fn stop(&self) {
        self.stop_inner(false);
    }

    /// Stop plus start, keeping the installed table through the
    /// transition so consumers observe continuity.
    pub fn reload(&self, refresh_delay: u64, priority: i32) -> Result<Token, Error> {
        self.stop_inner(true);
        self.task.update_params(|p| p.refresh_delay = refresh_delay);
        self.state.lock().unwrap().priority = priority;
        self.start()
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn priority(&self) -> i32 {
        self.state.lock().unwrap().priority
    }
}

impl TaskRunner for SourcetableFetcher {
    fn line(&self, _task: &Arc<Task>, line: &str) -> LineFlow {
        if line.trim() == END_SENTINEL {
            return LineFlow::Stop;
        }
        if let Some(table) = self.state.lock().unwrap().sourcetable.as_mut() {
            table.parse_line(line);
        }
        LineFlow::Continue
    }

    fn end(&self, task: &Arc<Task>, success: bool) {
        let params = task.params();
        let (table, started, keep, priority) = {
            let mut state = self.state.lock().unwrap();
            // the reload grace covers exactly one attempt
            let keep = std::mem::replace(&mut state.keep_sourcetable, false);
            (state.sourcetable.take(), state.started.take(), keep, state.priority)
        };
        let elapsed_ms = started.map_or(0.0, |t| t.elapsed().as_secs_f64() * 1000.0);

        if success && let Some(mut table) = table {
            table.priority = priority;
            let entries = table.nentries(false);
            info!(host = %params.host, port = params.port, entries, elapsed_ms, "sourcetable loaded");
            self.caster.sourcetables().replace_host(&params.host, params.port, Some(table));
        } else {
            warn!(host = %params.host, port = params.port, elapsed_ms, "sourcetable load failed");
            if !keep {
                self.caster.sourcetables().replace_host(&params.host, params.port, None);
            }
        }
        task.reschedule();
    }

    fn restart(&self, _task: &Arc<Task>) {
        if let Err(e) = self.start() {
            warn!(error = %e, "sourcetable fetch restart failed");
        }
    }
}
