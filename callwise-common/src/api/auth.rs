//! Webhook authentication via Basic-style credentials
//!
//! # Architecture
//!
//! - Each tenant owns a webhook username and secret stored in its tenant row
//! - PBX senders present them as `Authorization: Basic base64(username:secret)`
//! - Comparison is constant-time: both sides are reduced to HMAC-SHA-256 tags
//!   and checked with `Mac::verify_slice`, so neither the content nor the
//!   length of the stored secret leaks through response timing
//!
//! # Pure Functions
//!
//! This module contains ONLY pure functions.
//! No HTTP framework dependencies (Axum, etc.) - those are in service-specific code.

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Fixed message authenticated under each credential when comparing
const COMPARE_LABEL: &[u8] = b"callwise-webhook-credential-v1";

/// Length of generated webhook secrets
const GENERATED_SECRET_LEN: usize = 40;

// ========================================
// Error Types
// ========================================

/// Webhook authentication error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAuthError {
    /// No Authorization header present
    MissingHeader,

    /// Authorization header uses a scheme other than Basic
    UnsupportedScheme,

    /// Credential payload is not valid base64 / UTF-8
    InvalidEncoding(String),

    /// Decoded payload has no `username:secret` separator
    InvalidFormat,
}

impl std::fmt::Display for WebhookAuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookAuthError::MissingHeader => write!(f, "Missing Authorization header"),
            WebhookAuthError::UnsupportedScheme => {
                write!(f, "Unsupported authorization scheme (expected Basic)")
            }
            WebhookAuthError::InvalidEncoding(err) => {
                write!(f, "Invalid credential encoding: {}", err)
            }
            WebhookAuthError::InvalidFormat => {
                write!(f, "Invalid credential format (expected username:secret)")
            }
        }
    }
}

impl std::error::Error for WebhookAuthError {}

// ========================================
// Credential Parsing
// ========================================

/// Credentials presented by a PBX webhook sender
#[derive(Clone, PartialEq, Eq)]
pub struct WebhookCredentials {
    pub username: String,
    pub secret: String,
}

impl std::fmt::Debug for WebhookCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookCredentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Parse an `Authorization` header value of the form `Basic <base64>`
///
/// The scheme name is matched case-insensitively. The secret may itself
/// contain `:` characters; only the first separator splits the pair.
///
/// # Examples
///
/// ```
/// use callwise_common::api::auth::parse_basic_authorization;
///
/// // "acme:s3cret" in base64
/// let creds = parse_basic_authorization("Basic YWNtZTpzM2NyZXQ=").unwrap();
/// assert_eq!(creds.username, "acme");
/// assert_eq!(creds.secret, "s3cret");
/// ```
pub fn parse_basic_authorization(header: &str) -> Result<WebhookCredentials, WebhookAuthError> {
    let header = header.trim();
    if header.is_empty() {
        return Err(WebhookAuthError::MissingHeader);
    }

    let (scheme, encoded) = header
        .split_once(' ')
        .ok_or(WebhookAuthError::UnsupportedScheme)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(WebhookAuthError::UnsupportedScheme);
    }

    let decoded = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| WebhookAuthError::InvalidEncoding(e.to_string()))?;
    let decoded =
        String::from_utf8(decoded).map_err(|e| WebhookAuthError::InvalidEncoding(e.to_string()))?;

    let (username, secret) = decoded
        .split_once(':')
        .ok_or(WebhookAuthError::InvalidFormat)?;

    Ok(WebhookCredentials {
        username: username.to_string(),
        secret: secret.to_string(),
    })
}

// ========================================
// Constant-Time Comparison
// ========================================

/// Compare presented credentials with the stored pair in constant time
///
/// Both fields are always compared; the results are combined without
/// short-circuiting.
///
/// # Examples
///
/// ```
/// use callwise_common::api::auth::{credentials_match, WebhookCredentials};
///
/// let presented = WebhookCredentials {
///     username: "acme".to_string(),
///     secret: "s3cret".to_string(),
/// };
/// assert!(credentials_match("acme", "s3cret", &presented));
/// assert!(!credentials_match("acme", "other", &presented));
/// ```
pub fn credentials_match(
    expected_username: &str,
    expected_secret: &str,
    presented: &WebhookCredentials,
) -> bool {
    let user_ok = constant_time_eq(expected_username.as_bytes(), presented.username.as_bytes());
    let secret_ok = constant_time_eq(expected_secret.as_bytes(), presented.secret.as_bytes());
    user_ok & secret_ok
}

/// Constant-time byte comparison via HMAC tag verification
fn constant_time_eq(expected: &[u8], presented: &[u8]) -> bool {
    let expected_tag = match <HmacSha256 as Mac>::new_from_slice(expected) {
        Ok(mut mac) => {
            mac.update(COMPARE_LABEL);
            mac.finalize().into_bytes()
        }
        Err(_) => return false,
    };

    match <HmacSha256 as Mac>::new_from_slice(presented) {
        Ok(mut mac) => {
            mac.update(COMPARE_LABEL);
            mac.verify_slice(&expected_tag).is_ok()
        }
        Err(_) => false,
    }
}

// ========================================
// Secret Generation
// ========================================

/// Generate a random alphanumeric webhook secret for a newly provisioned tenant
pub fn generate_webhook_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_SECRET_LEN)
        .map(char::from)
        .collect()
}

// ========================================
// Tests
// ========================================

#[cfg(test)]
mod tests {
    use super::*;

    fn basic_header(user: &str, secret: &str) -> String {
        format!(
            "Basic {}",
            general_purpose::STANDARD.encode(format!("{}:{}", user, secret))
        )
    }

    #[test]
    fn test_parse_valid_basic_header() {
        let creds = parse_basic_authorization(&basic_header("pbx-user", "abc:def")).unwrap();
        assert_eq!(creds.username, "pbx-user");
        // Only the first colon separates username from secret
        assert_eq!(creds.secret, "abc:def");
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        let header = basic_header("u", "p").replacen("Basic", "bAsIc", 1);
        assert!(parse_basic_authorization(&header).is_ok());
    }

    #[test]
    fn test_bearer_scheme_rejected() {
        assert_eq!(
            parse_basic_authorization("Bearer abc.def"),
            Err(WebhookAuthError::UnsupportedScheme)
        );
    }

    #[test]
    fn test_empty_header_is_missing() {
        assert_eq!(
            parse_basic_authorization("   "),
            Err(WebhookAuthError::MissingHeader)
        );
    }

    #[test]
    fn test_garbage_base64_rejected() {
        assert!(matches!(
            parse_basic_authorization("Basic !!!not-base64!!!"),
            Err(WebhookAuthError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_missing_separator_rejected() {
        let header = format!("Basic {}", general_purpose::STANDARD.encode("no-separator"));
        assert_eq!(
            parse_basic_authorization(&header),
            Err(WebhookAuthError::InvalidFormat)
        );
    }

    #[test]
    fn test_credentials_match_exact_pair() {
        let creds = WebhookCredentials {
            username: "acme".to_string(),
            secret: "s3cret".to_string(),
        };
        assert!(credentials_match("acme", "s3cret", &creds));
    }

    #[test]
    fn test_credentials_mismatch_on_either_field() {
        let creds = WebhookCredentials {
            username: "acme".to_string(),
            secret: "s3cret".to_string(),
        };
        assert!(!credentials_match("other", "s3cret", &creds));
        assert!(!credentials_match("acme", "s3cret-longer", &creds));
        assert!(!credentials_match("acme", "", &creds));
    }

    #[test]
    fn test_empty_secret_only_matches_empty() {
        let creds = WebhookCredentials {
            username: "acme".to_string(),
            secret: String::new(),
        };
        assert!(credentials_match("acme", "", &creds));
        assert!(!credentials_match("acme", "x", &creds));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let creds = WebhookCredentials {
            username: "acme".to_string(),
            secret: "s3cret".to_string(),
        };
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("acme"));
    }

    #[test]
    fn test_generated_secrets_are_distinct_and_alphanumeric() {
        let a = generate_webhook_secret();
        let b = generate_webhook_secret();
        assert_eq!(a.len(), GENERATED_SECRET_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
