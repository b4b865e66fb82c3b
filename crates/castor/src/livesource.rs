use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::debug;

/// Lifecycle of a locally relayed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivesourceState {
    Init,
    /// Waiting for a (re)connect attempt to the upstream.
    FetchPending,
    Running,
}

/// In-memory registration of an active local stream. Redistribution
/// to subscribers is the embedding caster's concern; the pipeline
/// only drives the state and accounts relayed bytes.
pub struct Livesource {
    mountpoint: String,
    state: Mutex<LivesourceState>,
    received_bytes: AtomicU64,
}

impl Livesource {
    fn new(mountpoint: &str) -> Self {
        Self {
            mountpoint: mountpoint.to_string(),
            state: Mutex::new(LivesourceState::Init),
            received_bytes: AtomicU64::new(0),
        }
    }

    pub fn mountpoint(&self) -> &str {
        &self.mountpoint
    }

    pub fn state(&self) -> LivesourceState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: LivesourceState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn feed(&self, data: &[u8]) {
        self.received_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct LivesourceRegistry {
    map: Mutex<HashMap<String, Arc<Livesource>>>,
}

impl LivesourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing registration or creates a fresh one.
    pub fn register(&self, mountpoint: &str) -> Arc<Livesource> {
        self.map
            .lock()
            .unwrap()
            .entry(mountpoint.to_string())
            .or_insert_with(|| Arc::new(Livesource::new(mountpoint)))
            .clone()
    }

    pub fn unregister(&self, mountpoint: &str) {
        if self.map.lock().unwrap().remove(mountpoint).is_some() {
            debug!(mountpoint, "livesource unregistered");
        }
    }

    pub fn get(&self, mountpoint: &str) -> Option<Arc<Livesource>> {
        self.map.lock().unwrap().get(mountpoint).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let reg = LivesourceRegistry::new();
        let a = reg.register("MP1");
        let b = reg.register("MP1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);

        a.set_state(LivesourceState::Running);
        a.feed(b"abcd");
        assert_eq!(b.state(), LivesourceState::Running);
        assert_eq!(b.received_bytes(), 4);

        reg.unregister("MP1");
        assert!(reg.is_empty());
    }
}
