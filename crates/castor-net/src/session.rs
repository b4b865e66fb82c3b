use std::time::Duration;

use bytes::Bytes;
use mio::{Registry, Token};

use crate::{
    NetError,
    event_loop::SchedulerHandle,
    filter::InputFilter,
    stream::{ConnState, NetStream},
};

/// Connection-level events delivered to a session.
#[derive(Debug)]
pub enum ConnEvent {
    Connected,
    Eof,
    Error(NetError),
    ReadTimeout,
    WriteTimeout,
    /// Local teardown requested through [`SchedulerHandle::close`] or
    /// loop shutdown. The connection is gone after this returns.
    Shutdown,
}

/// What the session wants done with the connection after a callback.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Flow {
    Continue,
    Close,
}

/// A per-connection protocol driver.
///
/// All callbacks for one connection run serialized on the loop thread.
pub trait Session: Send {
    /// Called once on the loop thread right after the connection is
    /// registered, strictly before any event for it.
    fn on_start(&mut self, _io: &mut Io<'_>) {}

    /// Called when the connection could never be established (resolve
    /// or socket setup failure); no other callback will run.
    fn on_failed(&mut self, _sched: &SchedulerHandle, _err: &NetError) {}

    fn on_event(&mut self, io: &mut Io<'_>, ev: ConnEvent) -> Flow;

    /// Input arrived; pull lines or raw bytes from `io`.
    fn on_readable(&mut self, io: &mut Io<'_>) -> Flow;

    /// A queue kick: the connection is believed idle and new payloads
    /// may be waiting.
    fn on_idle_kick(&mut self, _io: &mut Io<'_>) -> Flow {
        Flow::Continue
    }
}

pub(crate) struct IoTimeouts {
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

/// Capability surface handed to session callbacks.
pub struct Io<'a> {
    pub(crate) token: Token,
    pub(crate) registry: &'a Registry,
    pub(crate) stream: &'a mut NetStream,
    pub(crate) filter: &'a mut InputFilter,
    pub(crate) timeouts: &'a mut IoTimeouts,
    pub(crate) sched: &'a SchedulerHandle,
    /// Set when a write fails mid-callback; the loop tears down after
    /// the callback returns.
    pub(crate) broken: bool,
}

impl Io<'_> {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn sched(&self) -> &SchedulerHandle {
        self.sched
    }

    /// Next complete decoded line, if any.
    pub fn read_line(&mut self) -> Option<String> {
        self.filter.read_line()
    }

    /// Drains all decoded input (raw streaming mode).
    pub fn take_input(&mut self) -> Bytes {
        self.filter.take()
    }

    pub fn input_len(&self) -> usize {
        self.filter.len()
    }

    /// Arms chunked-transfer decoding for all subsequent input.
    pub fn set_chunked(&mut self) -> Result<(), NetError> {
        self.filter.set_chunked()
    }

    /// Queues bytes for sending. The segment is refcounted; callers
    /// may keep their own handle to the same payload.
    pub fn write(&mut self, data: Bytes) {
        if self.stream.write(self.registry, self.token, data) == ConnState::Disconnected {
            self.broken = true;
        }
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.timeouts.read = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.timeouts.write = timeout;
    }
}
