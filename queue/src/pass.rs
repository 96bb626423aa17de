//! MAC-signed queue passes.
//!
//! A pass is `base64url(claims).base64url(hmac_sha256(secret, claims))`
//! where the claims are a small JSON document. Verification is constant
//! time on the MAC comparison. Single-use enforcement lives in the queue
//! itself (the signer is stateless).

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use booking_rush_core::{EventId, UserId};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const BLOCK_SIZE: usize = 64;

/// HMAC-SHA256 (RFC 2104) over `message` with `key`.
#[must_use]
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut block_key = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        block_key[..32].copy_from_slice(&Sha256::digest(key));
    } else {
        block_key[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    let ipad: Vec<u8> = block_key.iter().map(|b| b ^ 0x36).collect();
    inner.update(&ipad);
    inner.update(message);
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    let opad: Vec<u8> = block_key.iter().map(|b| b ^ 0x5c).collect();
    outer.update(&opad);
    outer.update(inner_hash);
    outer.finalize().into()
}

/// What a pass asserts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassClaims {
    /// Event the pass admits to.
    pub event_id: EventId,
    /// User the pass was issued to.
    pub user_id: UserId,
    /// Random pass identity; pairs the token with its server-side
    /// single-use record.
    pub nonce: String,
    /// When the pass stops admitting.
    pub expires_at: DateTime<Utc>,
}

/// Why a pass was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PassError {
    /// Not a `claims.mac` token or claims not valid JSON.
    #[error("malformed pass token")]
    Malformed,
    /// MAC mismatch.
    #[error("pass signature invalid")]
    BadSignature,
    /// Past `expires_at`.
    #[error("pass expired")]
    Expired,
    /// Claims do not match the presenting user or event.
    #[error("pass issued for a different user or event")]
    WrongSubject,
    /// Valid pass, but it was already used.
    #[error("pass already consumed")]
    Consumed,
    /// The server has no record of issuing this pass.
    #[error("pass not issued by this queue")]
    Unknown,
}

/// Issues and verifies pass tokens with a shared secret.
pub struct PassSigner {
    secret: Vec<u8>,
}

impl PassSigner {
    /// Creates a signer over `secret`.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// A fresh random nonce for pass identity.
    #[must_use]
    pub fn nonce() -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Signs claims into a token.
    ///
    /// # Errors
    ///
    /// Returns [`PassError::Malformed`] if the claims fail to serialize
    /// (practically unreachable).
    pub fn sign(&self, claims: &PassClaims) -> Result<String, PassError> {
        let body = serde_json::to_vec(claims).map_err(|_| PassError::Malformed)?;
        let mac = hmac_sha256(&self.secret, &body);
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&body),
            URL_SAFE_NO_PAD.encode(mac)
        ))
    }

    /// Verifies a token's structure, signature and expiry.
    ///
    /// # Errors
    ///
    /// [`PassError::Malformed`], [`PassError::BadSignature`] or
    /// [`PassError::Expired`].
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<PassClaims, PassError> {
        let (body_b64, mac_b64) = token.split_once('.').ok_or(PassError::Malformed)?;
        let body = URL_SAFE_NO_PAD
            .decode(body_b64)
            .map_err(|_| PassError::Malformed)?;
        let presented_mac = URL_SAFE_NO_PAD
            .decode(mac_b64)
            .map_err(|_| PassError::Malformed)?;

        let expected_mac = hmac_sha256(&self.secret, &body);
        if !constant_time_eq::constant_time_eq(&expected_mac, &presented_mac) {
            return Err(PassError::BadSignature);
        }

        let claims: PassClaims =
            serde_json::from_slice(&body).map_err(|_| PassError::Malformed)?;
        if now >= claims.expires_at {
            return Err(PassError::Expired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn claims(now: DateTime<Utc>) -> PassClaims {
        PassClaims {
            event_id: EventId::new(),
            user_id: UserId::new(),
            nonce: PassSigner::nonce(),
            expires_at: now + chrono::Duration::minutes(5),
        }
    }

    #[test]
    fn hmac_matches_rfc4231_test_case_2() {
        // Key "Jefe", data "what do ya want for nothing?".
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        let expected = [
            0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e, 0x6a, 0x04, 0x24, 0x26, 0x08, 0x95,
            0x75, 0xc7, 0x5a, 0x00, 0x3f, 0x08, 0x9d, 0x27, 0x39, 0x83, 0x9d, 0xec, 0x58, 0xb9,
            0x64, 0xec, 0x38, 0x43,
        ];
        assert_eq!(mac, expected);
    }

    #[test]
    fn sign_verify_roundtrip() {
        let now = Utc::now();
        let signer = PassSigner::new("queue-secret");
        let claims = claims(now);

        let token = signer.sign(&claims).unwrap();
        let verified = signer.verify(&token, now).unwrap();
        assert_eq!(verified, claims);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let now = Utc::now();
        let signer = PassSigner::new("queue-secret");
        let token = signer.sign(&claims(now)).unwrap();

        let mut tampered = token.clone();
        tampered.replace_range(0..1, if token.starts_with('A') { "B" } else { "A" });
        assert!(matches!(
            signer.verify(&tampered, now),
            Err(PassError::BadSignature | PassError::Malformed)
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let now = Utc::now();
        let token = PassSigner::new("secret-a").sign(&claims(now)).unwrap();
        assert_eq!(
            PassSigner::new("secret-b").verify(&token, now),
            Err(PassError::BadSignature)
        );
    }

    #[test]
    fn expired_pass_is_rejected() {
        let now = Utc::now();
        let signer = PassSigner::new("queue-secret");
        let token = signer.sign(&claims(now)).unwrap();
        assert_eq!(
            signer.verify(&token, now + chrono::Duration::minutes(6)),
            Err(PassError::Expired)
        );
    }
}
