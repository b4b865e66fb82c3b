use std::io;

use castor_net::NetError;
use thiserror::Error;

/// Failure kinds of the client pipeline.
///
/// `Overflow` and `QueueOverflow` are per-payload conditions that the
/// connection survives; everything else terminates it.
#[derive(Error, Debug)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(#[from] io::Error),
    #[error("read timeout")]
    ReadTimeout,
    #[error("write timeout")]
    WriteTimeout,
    #[error("protocol: {0}")]
    Protocol(&'static str),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("out of memory")]
    OutOfMemory,
    #[error("payload of {len} bytes exceeds bulk limit of {max}")]
    Overflow { len: usize, max: usize },
    #[error("queue overflow, {dropped} bytes dropped")]
    QueueOverflow { dropped: usize },
    #[error("scheduler unavailable")]
    Scheduler,
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<NetError> for Error {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Io(e) => Self::Transport(e),
            NetError::Tls(e) => Self::Transport(io::Error::other(e)),
            NetError::ServerName(h) | NetError::Resolve(h) => {
                Self::Transport(io::Error::other(format!("cannot reach {h}")))
            }
            NetError::Chunk(msg) => Self::Protocol(msg),
            NetError::SchedulerGone => Self::Scheduler,
        }
    }
}
