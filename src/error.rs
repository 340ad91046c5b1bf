//! Domain-specific error types for ul-nzb
//!
//! This module provides structured error handling with proper error chains
//! and context preservation.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the ul-nzb application
#[derive(Error, Debug)]
pub enum UlNzbError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("NNTP error: {0}")]
    Nntp(#[from] NntpError),

    #[error("Posting error: {0}")]
    Post(#[from] PostError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    NativeTls(#[from] native_tls::Error),
}

/// Configuration validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Missing [global] section in configuration file")]
    MissingGlobalSection,

    #[error("Invalid configuration: {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("No [Server*] sections configured")]
    NoServers,

    #[error("No newsgroups given (use --group)")]
    NoGroups,

    #[error("Posting multiple inputs requires an explicit --subject")]
    NoSubject,

    #[error("Invalid port {port} for server {server}")]
    InvalidPort { server: String, port: u16 },

    #[error("Invalid connection count {count} for server {server}")]
    InvalidConnections { server: String, count: usize },

    #[error("Input path does not exist: {0}")]
    InputNotFound(PathBuf),
}

/// NNTP protocol and connection errors
#[derive(Error, Debug)]
pub enum NntpError {
    #[error("Connection failed to {server}:{port}: {source}")]
    ConnectionFailed {
        server: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("Operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("TLS handshake failed: {0}")]
    TlsError(String),

    #[error("Server greeting refused: {0}")]
    Greeting(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Posting engine and segment production errors
#[derive(Error, Debug)]
pub enum PostError {
    #[error("Failed to read segment {piece} of {path}: {source}")]
    SegmentRead {
        path: PathBuf,
        piece: u32,
        source: std::io::Error,
    },

    #[error("Engine not started")]
    NotStarted,

    #[error("All connections lost; batch aborted")]
    NoConnectionsLeft,

    #[error("Batch aborted after a segment exceeded the retry limit")]
    Aborted,

    #[error("{failed} of {total} segments were not posted")]
    SegmentsFailed { failed: usize, total: usize },

    #[error("Failed to render NZB: {0}")]
    NzbRender(String),
}

impl NntpError {
    /// Transport-level failures all classify as protocol/connection
    /// errors for retry purposes.
    pub(crate) fn from_io(e: std::io::Error) -> Self {
        NntpError::Protocol(e.to_string())
    }
}

/// Result type alias using UlNzbError
pub type Result<T> = std::result::Result<T, UlNzbError>;
