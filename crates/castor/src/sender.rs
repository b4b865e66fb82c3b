use std::sync::{Arc, Weak};

use castor_net::Token;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    Error,
    caster::Caster,
    task::{Task, TaskParams, TaskRunner},
};

/// Pushes queued JSON payloads (telemetry, log events) to an upstream
/// HTTP endpoint, batching them below the bulk cap per request and
/// keeping the connection between pushes.
pub struct Sender {
    task: Arc<Task>,
}

impl Sender {
    /// Constructs stopped. `retry_delay` of 0 disables retries after
    /// a failed push cycle.
    pub fn new(
        caster: &Arc<Caster>,
        host: &str,
        port: u16,
        uri: &str,
        tls: bool,
        retry_delay: u64,
        bulk_max_size: usize,
        queue_max_size: usize,
        drainfilename: Option<String>,
    ) -> Arc<Self> {
        let mut params = TaskParams::new(host, port, uri, tls);
        params.method = "POST".to_string();
        params.refresh_delay = retry_delay;
        params.use_mimeq = true;
        params.connection_keepalive = true;
        let task =
            Task::new(caster.clone(), "sender", params, bulk_max_size, queue_max_size, drainfilename);

        let sender = Arc::new(Self { task });
        let runner: Weak<dyn TaskRunner> = Arc::downgrade(&(sender.clone() as Arc<dyn TaskRunner>));
        sender.task.set_runner(runner);
        sender
    }

    pub fn start(&self) -> Result<Token, Error> {
        self.task.start()
    }

    pub fn stop(&self) {
        self.task.stop();
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Serializes one event and queues it.
    pub fn queue_event<T: Serialize>(&self, event: &T) -> Result<(), Error> {
        let json =
            serde_json::to_string(event).map_err(|_| Error::Protocol("cannot encode event"))?;
        self.task.queue(&json);
        Ok(())
    }

    /// Queues an already-encoded payload.
    pub fn queue_json(&self, json: &str) {
        self.task.queue(json);
    }
}

impl TaskRunner for Sender {
    fn status(&self, task: &Arc<Task>, code: u16) {
        if code != 200 {
            let params = task.params();
            warn!(host = %params.host, port = params.port, code, "push rejected");
        }
    }

    fn end(&self, task: &Arc<Task>, success: bool) {
        if success {
            debug!("push cycle complete");
            return;
        }
        // retry later, keeping queued payloads
        task.reschedule();
    }

    fn restart(&self, task: &Arc<Task>) {
        if let Err(e) = task.start() {
            warn!(error = %e, "sender restart failed");
        }
    }
}
