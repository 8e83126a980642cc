//! Hard limit enforcement.
//!
//! All limits are checked at the boundary where the value enters the
//! system, so a run never starts with an out-of-range configuration.

use thiserror::Error;

/// Maximum model upload size in bytes (500 MB). Exactly 500 MB is accepted.
pub const MAX_MODEL_BYTES: u64 = 500 * 1024 * 1024;

/// Maximum number of cases in a promptpack.
pub const MAX_PROMPTPACK_CASES: usize = 50;

/// Maximum number of devices in a pipeline's device matrix.
pub const MAX_DEVICES_PER_RUN: usize = 5;

/// Measurement repeats range.
pub const MIN_REPEATS: u32 = 1;
/// Upper bound of the measurement repeats range.
pub const MAX_REPEATS: u32 = 5;

/// Maximum `max_new_tokens` for inference cases.
pub const MAX_NEW_TOKENS: u32 = 256;

/// Run timeout range in minutes.
pub const MIN_TIMEOUT_MINUTES: u32 = 1;
/// Upper bound of the run timeout range in minutes.
pub const MAX_TIMEOUT_MINUTES: u32 = 45;

/// Maximum CI nonce length in characters.
pub const MAX_NONCE_CHARS: usize = 64;

/// A hard limit was exceeded.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("limit exceeded: {limit} (got {value}, allowed {allowed})")]
pub struct LimitExceeded {
    /// Name of the violated limit.
    pub limit: &'static str,
    /// The offending value.
    pub value: f64,
    /// The allowed bound, rendered for the message.
    pub allowed: String,
}

impl LimitExceeded {
    fn new(limit: &'static str, value: f64, allowed: impl Into<String>) -> Self {
        Self {
            limit,
            value,
            allowed: allowed.into(),
        }
    }
}

/// Checks a model upload size. Exactly [`MAX_MODEL_BYTES`] passes.
///
/// # Errors
///
/// Returns [`LimitExceeded`] when the size is over the cap.
#[allow(clippy::cast_precision_loss)]
pub fn check_model_bytes(bytes: u64) -> Result<(), LimitExceeded> {
    if bytes > MAX_MODEL_BYTES {
        return Err(LimitExceeded::new(
            "model_upload_size",
            bytes as f64,
            format!("<= {MAX_MODEL_BYTES}"),
        ));
    }
    Ok(())
}

/// Checks a promptpack case count.
///
/// # Errors
///
/// Returns [`LimitExceeded`] when over [`MAX_PROMPTPACK_CASES`].
#[allow(clippy::cast_precision_loss)]
pub fn check_promptpack_cases(count: usize) -> Result<(), LimitExceeded> {
    if count > MAX_PROMPTPACK_CASES {
        return Err(LimitExceeded::new(
            "promptpack_cases",
            count as f64,
            format!("<= {MAX_PROMPTPACK_CASES}"),
        ));
    }
    Ok(())
}

/// Checks a device-matrix size.
///
/// # Errors
///
/// Returns [`LimitExceeded`] when empty or over [`MAX_DEVICES_PER_RUN`].
#[allow(clippy::cast_precision_loss)]
pub fn check_devices(count: usize) -> Result<(), LimitExceeded> {
    if count == 0 || count > MAX_DEVICES_PER_RUN {
        return Err(LimitExceeded::new(
            "devices_per_run",
            count as f64,
            format!("1..={MAX_DEVICES_PER_RUN}"),
        ));
    }
    Ok(())
}

/// Checks measurement repeats.
///
/// # Errors
///
/// Returns [`LimitExceeded`] outside `1..=5`.
pub fn check_repeats(repeats: u32) -> Result<(), LimitExceeded> {
    if !(MIN_REPEATS..=MAX_REPEATS).contains(&repeats) {
        return Err(LimitExceeded::new(
            "measurement_repeats",
            f64::from(repeats),
            format!("{MIN_REPEATS}..={MAX_REPEATS}"),
        ));
    }
    Ok(())
}

/// Checks `max_new_tokens`.
///
/// # Errors
///
/// Returns [`LimitExceeded`] when zero or over [`MAX_NEW_TOKENS`].
pub fn check_max_new_tokens(tokens: u32) -> Result<(), LimitExceeded> {
    if tokens == 0 || tokens > MAX_NEW_TOKENS {
        return Err(LimitExceeded::new(
            "max_new_tokens",
            f64::from(tokens),
            format!("1..={MAX_NEW_TOKENS}"),
        ));
    }
    Ok(())
}

/// Checks a run timeout.
///
/// # Errors
///
/// Returns [`LimitExceeded`] outside `1..=45` minutes.
pub fn check_timeout_minutes(minutes: u32) -> Result<(), LimitExceeded> {
    if !(MIN_TIMEOUT_MINUTES..=MAX_TIMEOUT_MINUTES).contains(&minutes) {
        return Err(LimitExceeded::new(
            "run_timeout_minutes",
            f64::from(minutes),
            format!("{MIN_TIMEOUT_MINUTES}..={MAX_TIMEOUT_MINUTES}"),
        ));
    }
    Ok(())
}

/// Checks a CI nonce length.
///
/// # Errors
///
/// Returns [`LimitExceeded`] when empty or over [`MAX_NONCE_CHARS`].
#[allow(clippy::cast_precision_loss)]
pub fn check_nonce(nonce: &str) -> Result<(), LimitExceeded> {
    let len = nonce.chars().count();
    if len == 0 || len > MAX_NONCE_CHARS {
        return Err(LimitExceeded::new(
            "nonce_length",
            len as f64,
            format!("1..={MAX_NONCE_CHARS}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_size_boundary() {
        assert!(check_model_bytes(MAX_MODEL_BYTES).is_ok());
        assert!(check_model_bytes(MAX_MODEL_BYTES + 1).is_err());
    }

    #[test]
    fn test_repeats_range() {
        assert!(check_repeats(0).is_err());
        assert!(check_repeats(1).is_ok());
        assert!(check_repeats(5).is_ok());
        assert!(check_repeats(6).is_err());
    }

    #[test]
    fn test_devices_range() {
        assert!(check_devices(0).is_err());
        assert!(check_devices(5).is_ok());
        assert!(check_devices(6).is_err());
    }

    #[test]
    fn test_timeout_range() {
        assert!(check_timeout_minutes(0).is_err());
        assert!(check_timeout_minutes(20).is_ok());
        assert!(check_timeout_minutes(45).is_ok());
        assert!(check_timeout_minutes(46).is_err());
    }

    #[test]
    fn test_nonce_length() {
        assert!(check_nonce("").is_err());
        assert!(check_nonce(&"n".repeat(64)).is_ok());
        assert!(check_nonce(&"n".repeat(65)).is_err());
    }

    #[test]
    fn test_error_message_names_limit() {
        let err = check_max_new_tokens(512).unwrap_err();
        assert!(err.to_string().contains("max_new_tokens"));
    }
}
