use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid server name {0:?}")]
    ServerName(String),
    #[error("cannot resolve {0}")]
    Resolve(String),
    #[error("bad chunk framing: {0}")]
    Chunk(&'static str),
    #[error("scheduler is gone")]
    SchedulerGone,
}
