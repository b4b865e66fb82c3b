mod chunk;
mod error;
mod event_loop;
mod filter;
mod session;
mod stream;
mod timer;

pub use error::NetError;
pub use event_loop::{ConnectParams, EventLoop, SchedulerHandle};
pub use mio::Token;
pub use session::{ConnEvent, Flow, Io, Session};
pub use timer::{TimerCallback, TimerHandle};
