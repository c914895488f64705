//! Error types for the image run pipeline.
//!
//! Every variant belongs to at most one pipeline [`Stage`]; the binary maps
//! any stage error to exit status 1, while a launched command's own exit
//! status is never represented as an error.

use std::fmt;
use std::path::PathBuf;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Auth,
    Manifest,
    Download,
    Extraction,
    Isolation,
    Exec,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth => write!(f, "auth"),
            Self::Manifest => write!(f, "manifest"),
            Self::Download => write!(f, "download"),
            Self::Extraction => write!(f, "extraction"),
            Self::Isolation => write!(f, "isolation"),
            Self::Exec => write!(f, "exec"),
        }
    }
}

/// Errors that can occur while pulling, assembling or launching an image.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Input Errors
    // =========================================================================
    /// Failed to parse image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Malformed content digest.
    #[error("invalid digest '{digest}': {reason}")]
    InvalidDigest { digest: String, reason: String },

    /// Invalid pipeline configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// Token exchange failed.
    #[error("authentication for '{repository}' failed{}: {reason}", status_suffix(.status))]
    Auth {
        repository: String,
        reason: String,
        status: Option<u16>,
    },

    /// Manifest retrieval or parsing failed.
    #[error("manifest for '{reference}' unavailable{}: {reason}{}", status_suffix(.status), body_suffix(.body.as_deref()))]
    Manifest {
        reference: String,
        reason: String,
        status: Option<u16>,
        body: Option<String>,
    },

    /// Layer blob download failed.
    #[error("failed to download layer {digest}{}: {reason}", status_suffix(.status))]
    Download {
        digest: String,
        reason: String,
        status: Option<u16>,
    },

    // =========================================================================
    // Root Filesystem Errors
    // =========================================================================
    /// Layer extraction failed.
    #[error("failed to extract layer {digest}: {reason}")]
    Extraction { digest: String, reason: String },

    /// Path traversal attempt detected in a layer archive.
    #[error("path traversal detected in layer {digest}: {path}")]
    PathTraversal { digest: String, path: String },

    // =========================================================================
    // Launch Errors
    // =========================================================================
    /// Could not confine the process to the assembled root.
    #[error("failed to enter root {}: {reason}", .path.display())]
    Isolation { path: PathBuf, reason: String },

    /// The target command could not be started.
    #[error("failed to start '{command}': {reason}")]
    Exec { command: String, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the pipeline stage this error belongs to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Auth { .. } => Some(Stage::Auth),
            Self::Manifest { .. } => Some(Stage::Manifest),
            Self::Download { .. } => Some(Stage::Download),
            Self::Extraction { .. } | Self::PathTraversal { .. } => Some(Stage::Extraction),
            Self::Isolation { .. } => Some(Stage::Isolation),
            Self::Exec { .. } => Some(Stage::Exec),
            Self::InvalidImageReference { .. }
            | Self::InvalidDigest { .. }
            | Self::Config(_)
            | Self::Io(_) => None,
        }
    }

    /// HTTP status that triggered this error, when it came from the registry.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Auth { status, .. }
            | Self::Manifest { status, .. }
            | Self::Download { status, .. } => *status,
            _ => None,
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

fn body_suffix(body: Option<&str>) -> String {
    match body {
        Some(b) if !b.trim().is_empty() => format!("; response: {}", b.trim()),
        _ => String::new(),
    }
}
