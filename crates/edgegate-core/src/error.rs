//! The closed set of error codes surfaced on runs and API responses.
//!
//! Components report their own structured errors internally; anything that
//! reaches a `Run` record or an API response is folded into one of these
//! codes. The string forms are stable - they are stored in the database and
//! consumed by CI clients.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable error classification for runs and API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    /// A hard limit was hit (model size, case count, devices, repeats,
    /// tokens, timeout).
    LimitExceeded,
    /// Model packaging-shape validation rejected the artifact.
    InvalidModelPackage,
    /// A referenced promptpack version is not published.
    DependencyNotPublished,
    /// The workspace has no active backend integration.
    NoIntegration,
    /// The backend rejected the integration credentials.
    TokenInvalid,
    /// External job submission failed after one retry.
    SubmitFailed,
    /// The backend reported a terminal job failure.
    BackendJobFailed,
    /// The run deadline was exceeded.
    Timeout,
    /// The run was cancelled explicitly.
    Cancelled,
    /// A required gate's metric has no stable mapping or no value.
    MissingRequiredMetric,
    /// A required gate depends on a metric whose dispersion exceeds the
    /// flake threshold.
    FlakyMetric,
    /// Evidence assembly or signing failed.
    BundleFailed,
    /// CI request timestamp outside the accepted window.
    StaleTimestamp,
    /// CI nonce already spent.
    Replay,
    /// CI HMAC signature mismatch.
    InvalidSignature,
    /// CI request names a workspace that does not exist.
    UnknownWorkspace,
    /// Caller lacks the required role.
    Forbidden,
    /// Entity does not exist (also returned for cross-tenant access).
    NotFound,
    /// Stored bytes do not match their recorded SHA-256.
    IntegrityError,
}

impl ErrorCode {
    /// Returns the stable string form stored on run records.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LimitExceeded => "LIMIT_EXCEEDED",
            Self::InvalidModelPackage => "INVALID_MODEL_PACKAGE",
            Self::DependencyNotPublished => "DEPENDENCY_NOT_PUBLISHED",
            Self::NoIntegration => "NO_INTEGRATION",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::SubmitFailed => "SUBMIT_FAILED",
            Self::BackendJobFailed => "BACKEND_JOB_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::MissingRequiredMetric => "MISSING_REQUIRED_METRIC",
            Self::FlakyMetric => "FLAKY_METRIC",
            Self::BundleFailed => "BUNDLE_FAILED",
            Self::StaleTimestamp => "STALE_TIMESTAMP",
            Self::Replay => "REPLAY",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::UnknownWorkspace => "UNKNOWN_WORKSPACE",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::IntegrityError => "INTEGRITY_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown error-code string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown error code: {0}")]
pub struct UnknownErrorCode(pub String);

impl FromStr for ErrorCode {
    type Err = UnknownErrorCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "LIMIT_EXCEEDED" => Self::LimitExceeded,
            "INVALID_MODEL_PACKAGE" => Self::InvalidModelPackage,
            "DEPENDENCY_NOT_PUBLISHED" => Self::DependencyNotPublished,
            "NO_INTEGRATION" => Self::NoIntegration,
            "TOKEN_INVALID" => Self::TokenInvalid,
            "SUBMIT_FAILED" => Self::SubmitFailed,
            "BACKEND_JOB_FAILED" => Self::BackendJobFailed,
            "TIMEOUT" => Self::Timeout,
            "CANCELLED" => Self::Cancelled,
            "MISSING_REQUIRED_METRIC" => Self::MissingRequiredMetric,
            "FLAKY_METRIC" => Self::FlakyMetric,
            "BUNDLE_FAILED" => Self::BundleFailed,
            "STALE_TIMESTAMP" => Self::StaleTimestamp,
            "REPLAY" => Self::Replay,
            "INVALID_SIGNATURE" => Self::InvalidSignature,
            "UNKNOWN_WORKSPACE" => Self::UnknownWorkspace,
            "FORBIDDEN" => Self::Forbidden,
            "NOT_FOUND" => Self::NotFound,
            "INTEGRITY_ERROR" => Self::IntegrityError,
            other => return Err(UnknownErrorCode(other.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[ErrorCode] = &[
        ErrorCode::LimitExceeded,
        ErrorCode::InvalidModelPackage,
        ErrorCode::DependencyNotPublished,
        ErrorCode::NoIntegration,
        ErrorCode::TokenInvalid,
        ErrorCode::SubmitFailed,
        ErrorCode::BackendJobFailed,
        ErrorCode::Timeout,
        ErrorCode::Cancelled,
        ErrorCode::MissingRequiredMetric,
        ErrorCode::FlakyMetric,
        ErrorCode::BundleFailed,
        ErrorCode::StaleTimestamp,
        ErrorCode::Replay,
        ErrorCode::InvalidSignature,
        ErrorCode::UnknownWorkspace,
        ErrorCode::Forbidden,
        ErrorCode::NotFound,
        ErrorCode::IntegrityError,
    ];

    #[test]
    fn test_string_forms_round_trip() {
        for code in ALL {
            let parsed: ErrorCode = code.as_str().parse().unwrap();
            assert_eq!(*code, parsed);
        }
    }

    #[test]
    fn test_serde_matches_as_str() {
        for code in ALL {
            let json = serde_json::to_string(code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert!("SOMETHING_ELSE".parse::<ErrorCode>().is_err());
    }
}
