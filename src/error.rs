//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the core returns [`CoreError`] (or a type
//! convertible into it). Call sites that only need a glue-level `Result`
//! (CLI, config loading) wrap this in `anyhow::Context` instead of matching
//! on it.

use std::path::PathBuf;

/// The error taxonomy described by the analyzer/indexer design: most
/// variants map 1:1 onto a recovery policy decided by the caller (see the
/// pipeline's cancellation behavior).
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    /// A pcap or pcap-ng byte stream violated the container format: bad
    /// magic, truncated block, unknown endianness, or a packet block that
    /// appeared before any section header.
    #[error("invalid pcap: {0}")]
    InvalidPcap(String),

    /// No slice, search, or root lookup produced any matching packets.
    #[error("no pcaps found")]
    NoPcapsFound,

    /// A record could not be decoded by the configured/detected codec.
    /// Callers downgrade this to a warning rather than treat it as fatal.
    #[error("invalid record in {path}: {reason}")]
    InvalidRecord { path: PathBuf, reason: String },

    /// The path supplied to a file-tailing operation is a directory.
    #[error("{0} is a directory, expected a regular file")]
    IsDirectory(PathBuf),

    /// An analyzer process exited with a non-zero status.
    #[error(transparent)]
    ProcessExit(#[from] Box<crate::analyzer::process::ProcessExitError>),

    /// Spawning a child process failed outright (not found, permissions).
    #[error("failed to start {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The run (or one of its tasks) was canceled before completion.
    #[error("canceled")]
    Canceled,

    /// An analyzer configuration violated an invariant (duplicate name,
    /// empty command, ...).
    #[error("invalid analyzer configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
