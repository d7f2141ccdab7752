//! Signed ticket tokens.
//!
//! A token binds a ticket id (and, for worker-facing tokens, the ticket's attachment names) to an
//! expiry. Holding a validly signed token is the only proof of ticket ownership; there is no
//! server-side session.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TicketClaims {
    #[serde(rename = "ticketId")]
    pub ticket_id: String,

    /// Expiration timestamp (Unix seconds).
    pub exp: i64,

    /// Attachment names the bearer may download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<String>>,
}

impl TicketClaims {
    pub fn new(ticket_id: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            exp: expires_at.timestamp(),
            attachments: None,
        }
    }

    pub fn with_attachments(mut self, names: Vec<String>) -> Self {
        self.attachments = Some(names);
        self
    }

    /// A token is only valid while `exp` is strictly in the future.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.exp <= now.timestamp()
    }

    pub fn allows_attachment(&self, name: &str) -> bool {
        self.attachments
            .as_ref()
            .map(|names| names.iter().any(|allowed| allowed == name))
            .unwrap_or(false)
    }
}

/// HMAC-SHA256 signer/verifier over a shared secret.
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenCodec {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    pub fn sign(&self, claims: &TicketClaims) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| TokenError::Generation(e.to_string()))
    }

    /// Check the signature only. Expiry is left to the caller so that an expired but authentic
    /// token can be told apart from a forged one.
    pub fn verify_signature(&self, token: &str) -> Result<TicketClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        self.decode_with(token, &validation)
    }

    /// Check the signature and that `exp` has not passed.
    pub fn verify(&self, token: &str) -> Result<TicketClaims, TokenError> {
        let claims = self.verify_signature(token)?;
        if claims.is_expired_at(Utc::now()) {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    /// Full verification plus a check that the token was issued for `ticket_id`.
    pub fn verify_for_ticket(&self, token: &str, ticket_id: &str) -> Result<TicketClaims, TokenError> {
        let claims = self.verify(token)?;
        if claims.ticket_id != ticket_id {
            return Err(TokenError::TicketMismatch {
                expected: ticket_id.to_string(),
                actual: claims.ticket_id,
            });
        }
        Ok(claims)
    }

    fn decode_with(&self, token: &str, validation: &Validation) -> Result<TicketClaims, TokenError> {
        decode::<TicketClaims>(token, &self.decoding, validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                _ => TokenError::InvalidFormat(e.to_string()),
            })
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("invalid token format: {0}")]
    InvalidFormat(String),

    #[error("ticket id mismatch: expected {expected}, got {actual}")]
    TicketMismatch { expected: String, actual: String },

    #[error("token generation failed: {0}")]
    Generation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const TEST_SECRET: &[u8] = b"test-secret-key-for-unit-tests";

    fn claims_in(ticket_id: &str, seconds: i64) -> TicketClaims {
        TicketClaims::new(ticket_id, Utc::now() + Duration::seconds(seconds))
    }

    #[test]
    fn signs_and_verifies_ticket_claims() {
        let codec = TokenCodec::new(TEST_SECRET);
        let token = codec.sign(&claims_in("t-1", 60)).unwrap();

        let claims = codec.verify(&token).unwrap();
        assert_eq!(claims.ticket_id, "t-1");
        assert_eq!(claims.attachments, None);
    }

    #[test]
    fn claims_serialize_with_camel_case_ticket_id() {
        let claims = claims_in("t-1", 60).with_attachments(vec!["a".to_string()]);
        let value = serde_json::to_value(&claims).unwrap();
        assert_eq!(value["ticketId"], "t-1");
        assert_eq!(value["attachments"][0], "a");
    }

    #[test]
    fn expired_token_keeps_valid_signature() {
        let codec = TokenCodec::new(TEST_SECRET);
        let token = codec.sign(&claims_in("t-1", -5)).unwrap();

        assert_eq!(codec.verify(&token).unwrap_err(), TokenError::Expired);
        let claims = codec.verify_signature(&token).unwrap();
        assert!(claims.is_expired_at(Utc::now()));
    }

    #[test]
    fn rejects_token_signed_with_other_secret() {
        let token = TokenCodec::new(b"other-secret")
            .sign(&claims_in("t-1", 60))
            .unwrap();
        let result = TokenCodec::new(TEST_SECRET).verify_signature(&token);
        assert_eq!(result.unwrap_err(), TokenError::InvalidSignature);
    }

    #[test]
    fn rejects_garbage_token() {
        let codec = TokenCodec::new(TEST_SECRET);
        match codec.verify_signature("not-a-valid-jwt") {
            Err(TokenError::InvalidFormat(_)) => {}
            other => panic!("expected InvalidFormat, got {other:?}"),
        }
    }

    #[test]
    fn verify_for_ticket_detects_mismatch() {
        let codec = TokenCodec::new(TEST_SECRET);
        let token = codec.sign(&claims_in("A", 60)).unwrap();

        assert!(codec.verify_for_ticket(&token, "A").is_ok());
        match codec.verify_for_ticket(&token, "B").unwrap_err() {
            TokenError::TicketMismatch { expected, actual } => {
                assert_eq!(expected, "B");
                assert_eq!(actual, "A");
            }
            other => panic!("expected TicketMismatch, got {other:?}"),
        }
    }

    #[test]
    fn attachment_allow_list() {
        let claims = claims_in("t", 60).with_attachments(vec!["f1".to_string()]);
        assert!(claims.allows_attachment("f1"));
        assert!(!claims.allows_attachment("f2"));
        assert!(!claims_in("t", 60).allows_attachment("f1"));
    }
}
