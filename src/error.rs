//! Error taxonomy shared by every proxy component.
//!
//! Each variant maps to a stable HTTP status and a short category string so
//! clients can distinguish "bad input" from "upstream broke" without parsing
//! messages. Transport errors are rendered to strings at the boundary where
//! they occur; nothing below the registry leaks a raw `reqwest::Error`.

use std::fmt;

use http::StatusCode;
use thiserror::Error;

use crate::stream::Service;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors surfaced to proxy clients.
///
/// `Clone` so that one failed resolution can be handed to every waiter that
/// coalesced onto it in the extraction cache.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    /// Missing or malformed request parameter.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// API password missing or wrong.
    #[error("unauthorized: invalid or missing API password")]
    Unauthorized,

    /// A resolver step failed.
    #[error("{service} extraction failed at '{stage}': {cause}")]
    ExtractionFailed {
        service: Service,
        stage: &'static str,
        cause: String,
    },

    /// ClearKey material did not decode to 16-byte KID/KEY values.
    #[error("bad DRM descriptor: {0}")]
    BadDrmDescriptor(String),

    /// CENC decryption failed (key mismatch, malformed boxes).
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Network failure, timeout or 5xx after retries were exhausted.
    #[error("upstream unavailable: {reason}")]
    UpstreamUnavailable { reason: String, timed_out: bool },

    /// Upstream answered with a 4xx; never retried.
    #[error("upstream rejected request with status {status}")]
    UpstreamRejected { status: u16 },

    /// Manifest could not be parsed or nested too deep.
    #[error("manifest rewrite failed: {0}")]
    Rewrite(String),

    /// Invalid configuration detected at start-up.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProxyError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn rewrite(msg: impl Into<String>) -> Self {
        Self::Rewrite(msg.into())
    }

    pub fn decryption(msg: impl Into<String>) -> Self {
        Self::Decryption(msg.into())
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            reason: reason.into(),
            timed_out: false,
        }
    }

    /// Classify a transport error from reqwest.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        Self::UpstreamUnavailable {
            reason: err.to_string(),
            timed_out: err.is_timeout(),
        }
    }

    /// Stable category string used in JSON error bodies and logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::ExtractionFailed { .. } => "extraction_failed",
            Self::BadDrmDescriptor(_) => "bad_drm_descriptor",
            Self::Decryption(_) => "decryption_error",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::Rewrite(_) => "rewrite_error",
            Self::Config(_) => "config_error",
        }
    }

    /// HTTP status returned to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::BadDrmDescriptor(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::ExtractionFailed { .. } | Self::Decryption(_) | Self::Rewrite(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::UpstreamUnavailable { timed_out: true, .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamRejected { status } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `true` when the upstream refused access (used to drop stale sessions).
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::UpstreamRejected { status: 403 })
    }
}

/// A single failed resolver step, before the registry attaches the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepError {
    pub stage: &'static str,
    pub cause: String,
    /// Upstream HTTP status when the step failed on a response code.
    pub status: Option<u16>,
}

impl StepError {
    pub fn new(stage: &'static str, cause: impl fmt::Display) -> Self {
        Self {
            stage,
            cause: cause.to_string(),
            status: None,
        }
    }

    pub fn status(stage: &'static str, status: u16) -> Self {
        Self {
            stage,
            cause: format!("upstream returned HTTP {status}"),
            status: Some(status),
        }
    }

    pub fn is_forbidden(&self) -> bool {
        self.status == Some(403)
    }

    pub fn into_proxy_error(self, service: Service) -> ProxyError {
        ProxyError::ExtractionFailed {
            service,
            stage: self.stage,
            cause: self.cause,
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.cause)
    }
}

impl std::error::Error for StepError {}

/// Attach a resolver stage name to any fallible value.
pub trait StageContext<T> {
    fn stage(self, stage: &'static str) -> std::result::Result<T, StepError>;
}

impl<T, E: fmt::Display> StageContext<T> for std::result::Result<T, E> {
    fn stage(self, stage: &'static str) -> std::result::Result<T, StepError> {
        self.map_err(|e| StepError::new(stage, e))
    }
}

impl<T> StageContext<T> for Option<T> {
    fn stage(self, stage: &'static str) -> std::result::Result<T, StepError> {
        self.ok_or_else(|| StepError::new(stage, "expected value not found in page"))
    }
}
