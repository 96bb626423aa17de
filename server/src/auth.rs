//! Authentication boundary.
//!
//! Real JWT validation happens upstream; this service only needs a
//! verified subject. [`TokenVerifier`] is that seam: production deploys a
//! verifier for the gateway's token format, tests and development use the
//! built-in MAC verifier, whose tokens are `<user uuid>.<base64 mac>`.

use crate::api::AppState;
use crate::error::ApiError;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use booking_rush_core::{ErrorCode, UserId};
use booking_rush_queue::hmac_sha256;
use uuid::Uuid;

/// Verifies a bearer token into a user id.
pub trait TokenVerifier: Send + Sync {
    /// The verified subject, or `None` for invalid tokens.
    fn verify(&self, token: &str) -> Option<UserId>;
}

/// MAC-based verifier: tokens are `<user uuid>.<base64url(hmac)>` signed
/// with the shared server secret.
pub struct HmacTokenVerifier {
    secret: Vec<u8>,
}

impl HmacTokenVerifier {
    /// Creates a verifier over `secret`.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Issues a token for `user_id` (development and test tooling).
    #[must_use]
    pub fn issue(&self, user_id: UserId) -> String {
        let subject = user_id.to_string();
        let mac = hmac_sha256(&self.secret, subject.as_bytes());
        format!("{subject}.{}", URL_SAFE_NO_PAD.encode(mac))
    }
}

impl TokenVerifier for HmacTokenVerifier {
    fn verify(&self, token: &str) -> Option<UserId> {
        let (subject, mac_b64) = token.split_once('.')?;
        let presented = URL_SAFE_NO_PAD.decode(mac_b64).ok()?;
        let expected = hmac_sha256(&self.secret, subject.as_bytes());
        if !constant_time_eq::constant_time_eq(&expected, &presented) {
            return None;
        }
        Uuid::parse_str(subject).ok().map(UserId::from_uuid)
    }
}

/// The authenticated user, extracted from `Authorization: Bearer`.
#[derive(Debug, Clone, Copy)]
pub struct AuthedUser(pub UserId);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                ApiError::new(ErrorCode::Unauthorized, "missing Authorization header")
            })?;
        let token = header.strip_prefix("Bearer ").ok_or_else(|| {
            ApiError::new(ErrorCode::Unauthorized, "expected a bearer token")
        })?;
        state
            .verifier
            .verify(token)
            .map(AuthedUser)
            .ok_or_else(|| ApiError::new(ErrorCode::Unauthorized, "invalid token"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn issue_verify_roundtrip() {
        let verifier = HmacTokenVerifier::new("server-secret");
        let user = UserId::new();
        let token = verifier.issue(user);
        assert_eq!(verifier.verify(&token), Some(user));
    }

    #[test]
    fn tampered_subject_is_rejected() {
        let verifier = HmacTokenVerifier::new("server-secret");
        let token = verifier.issue(UserId::new());
        let other = UserId::new().to_string();
        let (_, mac) = token.split_once('.').unwrap();
        assert_eq!(verifier.verify(&format!("{other}.{mac}")), None);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = HmacTokenVerifier::new("secret-a").issue(UserId::new());
        assert_eq!(HmacTokenVerifier::new("secret-b").verify(&token), None);
    }
}
