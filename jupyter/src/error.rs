//! Proxy errors

use thiserror::Error;

/// Errors raised by the proxy, its relay and the execution correlator
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Malformed multipart message (missing delimiter, too few segments)
    #[error("Framing error: {0}")]
    Framing(String),

    /// HMAC mismatch on a socket that requires signing
    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Unknown kernel: {0}")]
    UnknownKernel(String),

    /// Connecting the proxy to its own server endpoints
    #[error("Refusing to proxy kernel {0} to itself")]
    Loopback(String),

    #[error("ZeroMQ error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HMAC error: {0}")]
    Hmac(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No kernel is connected")]
    NotConnected,

    #[error("Socket channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Handler failure; the message it was handling is dropped
    #[error("Interceptor failed: {0}")]
    Interceptor(String),

    /// Handler failure that stops relaying on the socket it was raised on
    #[error("Fatal protocol error: {0}")]
    FatalProtocol(String),

    #[error("Execution {msg_id} timed out")]
    ExecutionTimeout { msg_id: String },

    #[error("Execution {0} is already pending")]
    DuplicateExecution(String),

    #[error("Could not parse return value: {0}")]
    ReturnParse(String),
}

impl ProxyError {
    /// Whether the relay should stop dispatching on the affected socket
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProxyError::FatalProtocol(_))
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
