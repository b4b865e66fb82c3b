use std::sync::{Arc, RwLock};

use castor_net::SchedulerHandle;

use crate::{
    config::Config, livesource::LivesourceRegistry, request::CredentialStore,
    sourcetable::SourcetableStack,
};

/// Hook invoked when a persistent redistributed stream should be
/// reattached after a failure; receives the mountpoint.
pub type RedistributeHook = Box<dyn Fn(&str) + Send + Sync>;

/// Shared caster state the client pipeline touches: configuration,
/// upstream credentials, the sourcetable stack, the livesource
/// registry, and the scheduler handle.
pub struct Caster {
    config: Config,
    credentials: CredentialStore,
    sourcetables: SourcetableStack,
    livesources: LivesourceRegistry,
    sched: SchedulerHandle,
    redistribute: RwLock<Option<RedistributeHook>>,
}

impl Caster {
    pub fn new(config: Config, credentials: CredentialStore, sched: SchedulerHandle) -> Arc<Self> {
        Arc::new(Self {
            config,
            credentials,
            sourcetables: SourcetableStack::new(),
            livesources: LivesourceRegistry::new(),
            sched,
            redistribute: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn sourcetables(&self) -> &SourcetableStack {
        &self.sourcetables
    }

    pub fn livesources(&self) -> &LivesourceRegistry {
        &self.livesources
    }

    pub fn sched(&self) -> &SchedulerHandle {
        &self.sched
    }

    /// Installs the external redistribute API.
    pub fn set_redistribute_hook(&self, hook: RedistributeHook) {
        *self.redistribute.write().unwrap() = Some(hook);
    }

    pub(crate) fn fire_redistribute(&self, mountpoint: &str) {
        if let Some(hook) = self.redistribute.read().unwrap().as_ref() {
            hook(mountpoint);
        }
    }
}
