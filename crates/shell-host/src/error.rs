//! Error types for the runner, editor, admin store and notifier.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::registry::OwnerId;

/// Failures surfaced by [`crate::runner::ProcessRunner`].
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("command is empty")]
    EmptyCommand,
    #[error("failed to spawn \"{command}\": {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("no running process for this conversation")]
    NotRunning,
    #[error("process is not keeping up with input")]
    InputQueueFull,
}

/// Editor failures. `Denied` is deliberately opaque: unknown tokens,
/// owner mismatches and path escapes all map to it.
#[derive(Error, Debug)]
pub enum EditorError {
    #[error("invalid or expired session")]
    Denied,
    #[error("file I/O failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum AdminError {
    #[error("invalid user id: {0:?}")]
    InvalidId(String),
    #[error("cannot remove the main admin")]
    CannotRemovePrimary,
    #[error("admin {0} is not in the list")]
    NotFound(OwnerId),
    #[error("failed to persist admins to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notifier channel closed")]
    Closed,
    #[error("delivery failed: {0}")]
    Io(#[from] io::Error),
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}
