//! Engine error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] sr_core::CoreError),

    #[error(transparent)]
    Net(#[from] sr_net::NetError),

    #[error("unknown source instance '{0}'")]
    UnknownSource(String),

    #[error("unknown sink '{0}'")]
    UnknownSink(String),

    #[error("unknown receiver on port {0}")]
    UnknownReceiver(u16),

    #[error("duplicate id '{0}'")]
    DuplicateId(String),

    #[error("component already running")]
    AlreadyRunning,

    #[error("failed to spawn thread: {0}")]
    Spawn(std::io::Error),

    #[error("engine is not initialized")]
    NotInitialized,

    #[error("mp3 encoder failure: {0}")]
    Mp3Encoder(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
