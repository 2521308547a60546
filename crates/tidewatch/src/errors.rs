use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A structured error annotation attached to a branch of a report (a protocol, a chain, a
/// token) that failed or degraded without aborting the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportError {
    pub code: String,
    pub message: String,
}

impl ReportError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_owned(),
            message: message.into(),
        }
    }
}

/// Failure of a single upstream call (RPC read, batch call, explorer or price API).
#[derive(Debug, Error, Clone)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("upstream http {status}: {message}")]
    Http { status: u16, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("call reverted: {0}")]
    Reverted(String),

    #[error("batch transport error: {0}")]
    BatchTransport(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl FetchError {
    /// Whether the fetch wrapper should try the producer again.
    ///
    /// Transport, rate-limit and 5xx failures are retried; anything the producer has already
    /// classified as permanent short-circuits the retry loop.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::RateLimited(_) | Self::BatchTransport(_) => true,
            Self::Http { status, .. } => *status >= 500,
            Self::Decode(_)
            | Self::Reverted(_)
            | Self::Unsupported(_)
            | Self::ConfigurationMissing(_)
            | Self::InvalidInput(_) => false,
        }
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport_error",
            Self::RateLimited(_) => "upstream_rate_limited",
            Self::Http { .. } => "upstream_http_error",
            Self::Decode(_) => "decode_error",
            Self::Reverted(_) => "call_reverted",
            Self::BatchTransport(_) => "batch_transport_error",
            Self::Unsupported(_) => "unsupported_chain_or_protocol",
            Self::ConfigurationMissing(_) => "configuration_missing",
            Self::InvalidInput(_) => "invalid_input",
        }
    }

    /// Classify a reqwest failure. Status-bearing errors map to `RateLimited`/`Http`.
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        match e.status() {
            Some(s) if s.as_u16() == 429 => Self::RateLimited(format!("{e}")),
            Some(s) => Self::Http {
                status: s.as_u16(),
                message: format!("{e}"),
            },
            None if e.is_decode() => Self::Decode(format!("{e}")),
            None => Self::Transport(format!("{e:#}")),
        }
    }
}

impl From<FetchError> for ReportError {
    fn from(e: FetchError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<&FetchError> for ReportError {
    fn from(e: &FetchError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}
