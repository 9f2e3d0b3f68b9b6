use thiserror::Error;

use crate::protocol::codec::CodecError;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Job queue is full for function {0}")]
    QueueFull(String),

    #[error("Persistent queue error: {0}")]
    Queue(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
