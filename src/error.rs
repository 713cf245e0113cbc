//! Crate error type.

use crate::protocol::{Attribute, ProtocolError};
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The worker has not reported `Ready` within the configured timeout.
    /// It may still be loading, or its backend may have failed silently.
    #[error("physics worker not ready after {0:?}")]
    NotReady(Duration),

    #[error("physics backend failed to initialise: {0}")]
    InitFailed(String),

    /// The worker thread has exited. Physics state is lost; the coordinator
    /// must be restarted.
    #[error("physics worker terminated")]
    WorkerTerminated,

    #[error("failed to spawn physics worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error("value does not fit attribute `{0}`")]
    AttributeMismatch(Attribute),
}

/// Creation-scoped failure: aborts one body, never the batch.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShapeError {
    #[error("unsupported shape")]
    Unsupported,
    #[error("{shape} expects {expected} argument(s), got {got}")]
    ArgCount {
        shape: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{shape} dimensions must be finite and positive: {args:?}")]
    InvalidDimensions { shape: &'static str, args: Vec<f32> },
}
