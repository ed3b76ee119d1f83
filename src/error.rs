//! Shared error type for the aggregation and download engine.

use thiserror::Error;

/// Engine-level error. Each variant maps to one HTTP envelope code; see
/// [`Error::http_code`].
#[derive(Debug, Error)]
pub enum Error {
    /// A request parameter is missing or invalid.
    #[error("invalid input: {0}")]
    Input(String),

    /// No rule matches the given source id or URL host.
    #[error("unknown source: {0}")]
    SourceUnknown(String),

    /// A required selector matched nothing, or the page schema changed.
    #[error("parse failed: {0}")]
    Parse(String),

    /// Connect/read/TLS failure or a bad HTTP status after all retries.
    #[error("network failure fetching {url} after {attempts} attempt(s)")]
    Network {
        url: String,
        last_status: Option<u16>,
        attempts: u32,
    },

    /// The upstream site is actively refusing us (403/429/Cloudflare 5xx).
    #[error("source blocked request to {url} (status {status})")]
    SourceBlocked { url: String, status: u16 },

    /// Unknown task id, or a TOC that resolved to zero chapters.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invariant violation inside the engine.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Envelope code for the REST surface.
    pub fn http_code(&self) -> u16 {
        match self {
            Self::Input(_) => 400,
            Self::NotFound(_) => 404,
            Self::SourceUnknown(_) => 404,
            Self::Parse(_) | Self::Network { .. } | Self::SourceBlocked { .. } => 500,
            Self::Internal(_) => 500,
        }
    }

}

pub type Result<T> = std::result::Result<T, Error>;
