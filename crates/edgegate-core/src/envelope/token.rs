//! The backend token value type.
//!
//! Token plaintext exists in worker memory only while a run or probe is
//! talking to the backend. Everywhere else - logs, API responses, audit
//! payloads - the token is representable only as `"****" + last4`.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

/// An integration token for the external compute hub.
///
/// `Display` and `Debug` render the redacted form. The plaintext is
/// reachable only through [`BackendToken::expose`], which borrows; the
/// token cannot be serialized.
pub struct BackendToken {
    secret: SecretString,
    last4: String,
}

impl BackendToken {
    /// Wraps a plaintext token.
    #[must_use]
    pub fn new(plaintext: impl Into<String>) -> Self {
        let plaintext = plaintext.into();
        let last4 = last4_of(&plaintext);
        Self {
            secret: SecretString::from(plaintext),
            last4,
        }
    }

    /// Reconstructs a token from bytes produced by the envelope.
    ///
    /// # Errors
    ///
    /// Returns the invalid bytes' length if they are not UTF-8.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, usize> {
        std::str::from_utf8(bytes)
            .map(Self::new)
            .map_err(|_| bytes.len())
    }

    /// The last four characters - the only substring ever shown to clients.
    #[must_use]
    pub fn last4(&self) -> &str {
        &self.last4
    }

    /// Borrows the plaintext. Callers hold this only across the backend
    /// call that needs it.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.secret.expose_secret()
    }
}

impl fmt::Display for BackendToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "****{}", self.last4)
    }
}

impl fmt::Debug for BackendToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendToken")
            .field("last4", &self.last4)
            .finish_non_exhaustive()
    }
}

/// Derives the displayable suffix. Tokens shorter than four characters are
/// fully masked.
fn last4_of(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() < 4 {
        "*".repeat(chars.len())
    } else {
        chars[chars.len() - 4..].iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_redacts() {
        let token = BackendToken::new("qai_live_0123456789abcd");
        assert_eq!(token.to_string(), "****abcd");
    }

    #[test]
    fn test_debug_redacts() {
        let token = BackendToken::new("qai_live_0123456789abcd");
        let debug = format!("{token:?}");
        assert!(debug.contains("abcd"));
        assert!(!debug.contains("0123456789"));
    }

    #[test]
    fn test_short_token_fully_masked() {
        let token = BackendToken::new("abc");
        assert_eq!(token.last4(), "***");
        assert_eq!(token.to_string(), "*******");
    }

    #[test]
    fn test_expose_returns_plaintext() {
        let token = BackendToken::new("secret-token-wxyz");
        assert_eq!(token.expose(), "secret-token-wxyz");
    }

    #[test]
    fn test_from_bytes() {
        let token = BackendToken::from_bytes(b"byte-token-1234").unwrap();
        assert_eq!(token.last4(), "1234");
        assert!(BackendToken::from_bytes(&[0xff, 0xfe]).is_err());
    }
}
