//! Network error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("failed to bind UDP port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("receiver already running")]
    AlreadyRunning,

    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

pub type NetResult<T> = Result<T, NetError>;
