use std::time::Duration;

use serde::Deserialize;

/// Knobs consumed by the client pipeline. All delays are in seconds;
/// loading from a file is the embedding caster's concern.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connect/read/write timeout for sourcetable fetches.
    pub sourcetable_fetch_timeout: u64,
    /// Read timeout once a correction stream is flowing.
    pub source_read_timeout: u64,
    /// Non-persistent streams are dropped after this much silence.
    pub idle_max_delay: u64,
    /// Delay before a redistribute reconnect attempt.
    pub reconnect_delay: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sourcetable_fetch_timeout: 60,
            source_read_timeout: 60,
            idle_max_delay: 60,
            reconnect_delay: 10,
        }
    }
}

impl Config {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.sourcetable_fetch_timeout)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_read_timeout)
    }

    pub fn reconnect(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }
}
