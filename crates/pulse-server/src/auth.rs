//! Stateless bearer credentials.
//!
//! A token is `base32(user_id ‖ expiry_ms ‖ keyed-BLAKE3 tag)`: an opaque,
//! identity-carrying credential verified with a MAC check and an expiry
//! compare, no session storage. Who gets a token minted (registration,
//! password checks, SSO) is outside this service's contract.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use data_encoding::BASE32_NOPAD;
use pulse_core::{Timestamp, UserId};
use pulse_db::User;
use snafu::Snafu;

use crate::error::{ApiError, UnauthorizedSnafu};
use crate::AppState;

/// Key-derivation context; versioned so a format change invalidates old
/// tokens instead of misinterpreting them.
const TOKEN_KEY_CONTEXT: &str = "pulse auth token v1";

const TOKEN_PAYLOAD_LEN: usize = 16;
const TOKEN_LEN: usize = TOKEN_PAYLOAD_LEN + blake3::OUT_LEN;

#[derive(Debug, Snafu)]
pub enum TokenError {
    #[snafu(display("Token is malformed"))]
    Malformed,
    #[snafu(display("Token signature mismatch"))]
    BadSignature,
    #[snafu(display("Token expired"))]
    Expired,
}

/// Mints and verifies bearer tokens with a key derived from `TOKEN_SECRET`.
#[derive(Clone)]
pub struct AuthTokens {
    key: [u8; 32],
    ttl: Duration,
}

impl AuthTokens {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            key: blake3::derive_key(TOKEN_KEY_CONTEXT, secret.as_bytes()),
            ttl,
        }
    }

    pub fn mint(&self, user_id: UserId, now: Timestamp) -> String {
        let expires_at = Timestamp(
            now.as_millis()
                .saturating_add(u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX)),
        );

        let mut bytes = [0u8; TOKEN_LEN];
        bytes[..8].copy_from_slice(&user_id.0.to_be_bytes());
        bytes[8..16].copy_from_slice(&expires_at.as_millis().to_be_bytes());
        let tag = blake3::keyed_hash(&self.key, &bytes[..TOKEN_PAYLOAD_LEN]);
        bytes[TOKEN_PAYLOAD_LEN..].copy_from_slice(tag.as_bytes());

        BASE32_NOPAD.encode(&bytes)
    }

    pub fn verify(&self, token: &str, now: Timestamp) -> Result<UserId, TokenError> {
        let bytes = BASE32_NOPAD
            .decode(token.as_bytes())
            .map_err(|_| TokenError::Malformed)?;
        let bytes: [u8; TOKEN_LEN] = bytes.try_into().map_err(|_| TokenError::Malformed)?;

        let expected = blake3::keyed_hash(&self.key, &bytes[..TOKEN_PAYLOAD_LEN]);
        let presented = blake3::Hash::from_bytes(
            bytes[TOKEN_PAYLOAD_LEN..]
                .try_into()
                .expect("fixed-size slice"),
        );
        // blake3::Hash equality is constant-time.
        if expected != presented {
            return Err(TokenError::BadSignature);
        }

        let user_id = u64::from_be_bytes(bytes[..8].try_into().expect("fixed-size slice"));
        let expires_at = u64::from_be_bytes(bytes[8..16].try_into().expect("fixed-size slice"));
        if expires_at < now.as_millis() {
            return Err(TokenError::Expired);
        }

        Ok(UserId(user_id))
    }
}

/// Extractor for the authenticated user behind `Authorization: Bearer`.
pub struct AuthUser(pub User);

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                UnauthorizedSnafu {
                    msg: "Missing bearer credential",
                }
                .build()
            })?;

        let token = header.strip_prefix("Bearer ").ok_or_else(|| {
            UnauthorizedSnafu {
                msg: "Expected a bearer credential",
            }
            .build()
        })?;

        let user_id = state
            .auth
            .verify(token, Timestamp::now())
            .map_err(|err| {
                UnauthorizedSnafu {
                    msg: err.to_string(),
                }
                .build()
            })?;

        let user = state.db.get_user(user_id).await?.ok_or_else(|| {
            UnauthorizedSnafu {
                msg: "Credential for an unknown user",
            }
            .build()
        })?;

        Ok(AuthUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> AuthTokens {
        AuthTokens::new("test-secret", Duration::from_secs(3600))
    }

    #[test]
    fn mint_verify_round_trip() {
        let auth = tokens();
        let now = Timestamp(1_000_000);

        let token = auth.mint(UserId(42), now);
        assert_eq!(auth.verify(&token, now).unwrap(), UserId(42));

        // Still valid just before expiry, dead just after.
        let last_valid = Timestamp(now.as_millis() + 3600 * 1000);
        assert_eq!(auth.verify(&token, last_valid).unwrap(), UserId(42));
        assert!(matches!(
            auth.verify(&token, Timestamp(last_valid.as_millis() + 1)),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn tampered_or_foreign_tokens_are_rejected() {
        let auth = tokens();
        let now = Timestamp(1_000_000);
        let token = auth.mint(UserId(42), now);

        assert!(matches!(
            auth.verify("not-a-token", now),
            Err(TokenError::Malformed)
        ));

        let mut bytes = BASE32_NOPAD.decode(token.as_bytes()).unwrap();
        bytes[0] ^= 0xff;
        let tampered = BASE32_NOPAD.encode(&bytes);
        assert!(matches!(
            auth.verify(&tampered, now),
            Err(TokenError::BadSignature)
        ));

        let other = AuthTokens::new("other-secret", Duration::from_secs(3600));
        assert!(matches!(
            other.verify(&token, now),
            Err(TokenError::BadSignature)
        ));
    }
}
