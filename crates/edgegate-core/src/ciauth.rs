//! HMAC authentication primitives for the CI ingress.
//!
//! A CI request carries four headers: workspace, ISO-8601 timestamp, an
//! opaque nonce (at most 64 chars), and a hex HMAC-SHA256 signature over
//! the byte concatenation `timestamp \n nonce \n body`.
//!
//! This module owns the pure parts: message construction, constant-time
//! signature verification, and the clock-skew window. Nonce single-use is
//! a storage concern - the daemon spends nonces with a unique insert and
//! maps the conflict to `REPLAY`.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::limits;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the workspace id.
pub const WORKSPACE_HEADER: &str = "x-edgegate-workspace";

/// Header carrying the ISO-8601 UTC timestamp.
pub const TIMESTAMP_HEADER: &str = "x-edgegate-timestamp";

/// Header carrying the single-use nonce.
pub const NONCE_HEADER: &str = "x-edgegate-nonce";

/// Header carrying the hex HMAC-SHA256 signature.
pub const SIGNATURE_HEADER: &str = "x-edgegate-signature";

/// Accepted clock skew in either direction. Exactly this skew is accepted;
/// one millisecond more is stale.
pub const MAX_SKEW: Duration = Duration::seconds(300);

/// Nonce lifetime in the replay table.
pub const NONCE_TTL: Duration = Duration::seconds(300);

/// CI authentication failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CiAuthError {
    /// Timestamp outside the +/- 5 minute window.
    #[error("request timestamp outside the accepted window")]
    StaleTimestamp,

    /// Signature did not verify.
    #[error("invalid request signature")]
    InvalidSignature,

    /// A header was missing or malformed.
    #[error("malformed header {header}: {message}")]
    MalformedHeader {
        /// Which header.
        header: &'static str,
        /// What was wrong.
        message: String,
    },
}

/// Builds the signed message: `timestamp \n nonce \n body`.
#[must_use]
pub fn signing_message(timestamp: &str, nonce: &str, body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(timestamp.len() + nonce.len() + 2 + body.len());
    message.extend_from_slice(timestamp.as_bytes());
    message.push(b'\n');
    message.extend_from_slice(nonce.as_bytes());
    message.push(b'\n');
    message.extend_from_slice(body);
    message
}

/// Computes the hex signature for a request; used by clients and tests.
#[must_use]
pub fn compute_signature(secret: &[u8], timestamp: &str, nonce: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(&signing_message(timestamp, nonce, body));
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a request signature in constant time.
///
/// # Errors
///
/// Returns [`CiAuthError::InvalidSignature`] on mismatch or non-hex input.
pub fn verify_signature(
    secret: &[u8],
    provided_hex: &str,
    timestamp: &str,
    nonce: &str,
    body: &[u8],
) -> Result<(), CiAuthError> {
    let provided = hex::decode(provided_hex).map_err(|_| CiAuthError::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(&signing_message(timestamp, nonce, body));
    let expected = mac.finalize().into_bytes();

    if expected.ct_eq(provided.as_slice()).into() {
        Ok(())
    } else {
        Err(CiAuthError::InvalidSignature)
    }
}

/// Parses the timestamp header (RFC 3339 / ISO-8601 with offset).
///
/// # Errors
///
/// Returns [`CiAuthError::MalformedHeader`] for unparseable input.
pub fn parse_timestamp(timestamp: &str) -> Result<DateTime<Utc>, CiAuthError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CiAuthError::MalformedHeader {
            header: TIMESTAMP_HEADER,
            message: e.to_string(),
        })
}

/// Checks the timestamp against the skew window, inclusive at the edges.
///
/// # Errors
///
/// Returns [`CiAuthError::StaleTimestamp`] outside the window.
pub fn check_timestamp(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), CiAuthError> {
    let skew = (now - timestamp).abs();
    if skew > MAX_SKEW {
        return Err(CiAuthError::StaleTimestamp);
    }
    Ok(())
}

/// Validates the nonce header shape (non-empty, at most 64 chars).
///
/// # Errors
///
/// Returns [`CiAuthError::MalformedHeader`] on violation.
pub fn check_nonce_shape(nonce: &str) -> Result<(), CiAuthError> {
    limits::check_nonce(nonce).map_err(|e| CiAuthError::MalformedHeader {
        header: NONCE_HEADER,
        message: e.to_string(),
    })
}

/// Computes when a nonce row should expire.
#[must_use]
pub fn nonce_expiry(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp + NONCE_TTL
}

/// Full header verification short of the nonce-spend: shape, window,
/// signature. Returns the parsed timestamp so the caller can derive the
/// nonce expiry.
///
/// # Errors
///
/// Returns the first [`CiAuthError`] encountered, checked in the order
/// shape, window, signature.
pub fn verify_request(
    secret: &[u8],
    timestamp: &str,
    nonce: &str,
    signature_hex: &str,
    body: &[u8],
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, CiAuthError> {
    check_nonce_shape(nonce)?;
    let parsed = parse_timestamp(timestamp)?;
    check_timestamp(parsed, now)?;
    verify_signature(secret, signature_hex, timestamp, nonce, body)?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"ci-secret-for-tests-0123456789ab";

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_signature_round_trip() {
        let ts = "2026-08-02T10:00:00Z";
        let sig = compute_signature(SECRET, ts, "nonce-1", b"{\"pipeline\":\"p\"}");
        verify_signature(SECRET, &sig, ts, "nonce-1", b"{\"pipeline\":\"p\"}").unwrap();
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let ts = "2026-08-02T10:00:00Z";
        let sig = compute_signature(b"other-secret", ts, "nonce-1", b"body");
        assert_eq!(
            verify_signature(SECRET, &sig, ts, "nonce-1", b"body"),
            Err(CiAuthError::InvalidSignature)
        );
    }

    #[test]
    fn test_any_component_change_rejected() {
        let ts = "2026-08-02T10:00:00Z";
        let sig = compute_signature(SECRET, ts, "nonce-1", b"body");
        assert!(verify_signature(SECRET, &sig, "2026-08-02T10:00:01Z", "nonce-1", b"body").is_err());
        assert!(verify_signature(SECRET, &sig, ts, "nonce-2", b"body").is_err());
        assert!(verify_signature(SECRET, &sig, ts, "nonce-1", b"tampered").is_err());
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        assert_eq!(
            verify_signature(SECRET, "zz-not-hex", "t", "n", b""),
            Err(CiAuthError::InvalidSignature)
        );
    }

    #[test]
    fn test_empty_body_get_request() {
        let ts = "2026-08-02T10:00:00Z";
        let sig = compute_signature(SECRET, ts, "nonce-get", b"");
        verify_signature(SECRET, &sig, ts, "nonce-get", b"").unwrap();
    }

    #[test]
    fn test_message_layout() {
        assert_eq!(signing_message("T", "N", b"B"), b"T\nN\nB");
    }

    #[test]
    fn test_skew_window_inclusive_boundary() {
        let reference = now();
        // Exactly 5:00 of skew in either direction is accepted.
        check_timestamp(reference - MAX_SKEW, reference).unwrap();
        check_timestamp(reference + MAX_SKEW, reference).unwrap();
        // One millisecond beyond is stale.
        assert_eq!(
            check_timestamp(reference - MAX_SKEW - Duration::milliseconds(1), reference),
            Err(CiAuthError::StaleTimestamp)
        );
        assert_eq!(
            check_timestamp(reference + MAX_SKEW + Duration::milliseconds(1), reference),
            Err(CiAuthError::StaleTimestamp)
        );
    }

    #[test]
    fn test_timestamp_parsing() {
        assert!(parse_timestamp("2026-08-02T10:00:00Z").is_ok());
        assert!(parse_timestamp("2026-08-02T10:00:00+00:00").is_ok());
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_nonce_shape() {
        assert!(check_nonce_shape("n").is_ok());
        assert!(check_nonce_shape(&"n".repeat(64)).is_ok());
        assert!(check_nonce_shape("").is_err());
        assert!(check_nonce_shape(&"n".repeat(65)).is_err());
    }

    #[test]
    fn test_verify_request_order() {
        // A request failing both the window and the signature reports the
        // window first.
        let stale = (now() - Duration::seconds(600)).to_rfc3339();
        let result = verify_request(SECRET, &stale, "nonce", "00", b"", now());
        assert_eq!(result, Err(CiAuthError::StaleTimestamp));
    }

    #[test]
    fn test_verify_request_accepts_valid() {
        let ts = now().to_rfc3339();
        let sig = compute_signature(SECRET, &ts, "nonce-ok", b"body");
        let parsed = verify_request(SECRET, &ts, "nonce-ok", &sig, b"body", now()).unwrap();
        assert_eq!(nonce_expiry(parsed), parsed + NONCE_TTL);
    }
}
