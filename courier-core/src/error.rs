//! Error types surfaced by the [`Controller`](crate::controller::Controller).
//!
//! Courier distinguishes a handful of failure classes:
//! - Usage errors (a missing queue suffix, an unknown exchange type) are raised
//!   synchronously at the call site and are recoverable by the caller.
//! - Serialization errors are raised synchronously from `send`; the message is
//!   never enqueued.
//! - Transient broker errors are absorbed by the worker's reconnect loop and
//!   never reach the caller while reconnection is enabled. With reconnection
//!   disabled, the worker stops and every later call on that exchange returns
//!   [`CourierError::WorkerStopped`].
//! - Acknowledging a delivery whose channel has been replaced yields
//!   [`CourierError::StaleDeliveryTag`].
//!
//! Configuration errors are not part of this taxonomy; see
//! [`ConfigError`](crate::config::ConfigError).
use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Errors returned by the public messaging operations.
#[derive(Error, Debug)]
pub enum CourierError {
    /// First use of an exchange must name the queue suffix.
    #[error("a queue suffix must be provided the first time exchange `{0}` is used")]
    MissingQueueSuffix(String),

    /// The exchange type is not one of fanout, topic, direct or headers.
    #[error("invalid exchange type `{0}`, expected one of: fanout, topic, direct, headers")]
    InvalidExchangeType(String),

    /// The payload could not be serialized; nothing was enqueued.
    #[error("serialization failed for a message on exchange `{exchange}`: {reason}")]
    SerializationFailed { exchange: String, reason: String },

    /// The body of a delivered message could not be decoded.
    #[error("failed to decode message body: {0}")]
    DeserializationFailed(String),

    /// The delivery tag belongs to a channel that has been closed or replaced.
    #[error("delivery tag {tag} on exchange `{exchange}` belongs to a channel that is no longer open")]
    StaleDeliveryTag { exchange: String, tag: u64 },

    /// No worker is registered for the exchange in the required direction.
    #[error("no worker is registered for exchange `{0}`")]
    UnknownExchange(String),

    /// The worker owning the exchange has terminated.
    #[error("the {role} for exchange `{exchange}` has stopped: {reason}")]
    WorkerStopped {
        exchange: String,
        role: &'static str,
        reason: String,
    },

    /// The producer stopped with messages it never published.
    #[error("publishing to exchange `{exchange}` failed after {attempts} attempt(s): {reason}")]
    PublishFailed {
        exchange: String,
        attempts: u32,
        reason: String,
    },

    /// The worker did not answer a request in time.
    #[error("the worker for exchange `{exchange}` did not respond within {timeout:?}")]
    Timeout { exchange: String, timeout: Duration },

    /// The broker refused an operation.
    #[error("broker rejected {operation} on exchange `{exchange}`: {reason}")]
    Broker {
        operation: &'static str,
        exchange: String,
        reason: String,
    },

    #[error("failed to open log file {path}: {source}")]
    LogSink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, CourierError>;
