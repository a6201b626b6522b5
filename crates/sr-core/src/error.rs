//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid audio format: {0}")]
    InvalidFormat(String),

    #[error("invalid payload size: expected {expected} bytes, got {got}")]
    InvalidPayloadSize { expected: usize, got: usize },

    #[error("queue disconnected")]
    QueueClosed,
}

pub type CoreResult<T> = Result<T, CoreError>;
