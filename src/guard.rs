//! Bearer-token check in front of the ticket polling routes.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use hyper::HeaderMap;
use hyper::header::AUTHORIZATION;
use regex::Regex;

use crate::error::AccessError;
use crate::gateway_log;
use crate::token::{TicketClaims, TokenCodec};

static BEARER: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^Bearer (.+)$").ok());

/// The credential from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let pattern = BEARER.as_ref()?;
    pattern
        .captures(value)
        .and_then(|captures| captures.get(1))
        .map(|token| token.as_str().to_string())
}

#[derive(Clone)]
pub struct TicketAccessGuard {
    codec: Arc<TokenCodec>,
}

impl TicketAccessGuard {
    pub fn new(codec: Arc<TokenCodec>) -> Self {
        Self { codec }
    }

    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        ticket_id: &str,
    ) -> Result<TicketClaims, AccessError> {
        self.authenticate_at(headers, ticket_id, Utc::now())
    }

    /// An expired token is reported as [`AccessError::NotFound`] so that it looks the same as a
    /// ticket that never existed.
    pub fn authenticate_at(
        &self,
        headers: &HeaderMap,
        ticket_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TicketClaims, AccessError> {
        let Some(token) = bearer_token(headers) else {
            gateway_log::info(
                module_path!(),
                "request dropped due to missing Authorization header",
            );
            return Err(AccessError::Unauthorized);
        };
        let claims = self.codec.verify_signature(&token).map_err(|err| {
            gateway_log::info(
                module_path!(),
                format!("request dropped due to invalid token: {err}"),
            );
            AccessError::Forbidden
        })?;
        if claims.is_expired_at(now) {
            gateway_log::info(module_path!(), "request dropped due to expired token");
            return Err(AccessError::NotFound);
        }
        if claims.ticket_id != ticket_id {
            gateway_log::info(module_path!(), "request dropped due to ticket id mismatch");
            return Err(AccessError::Forbidden);
        }
        Ok(claims)
    }
}

pub fn authorize_attachment(claims: &TicketClaims, name: &str) -> Result<(), AccessError> {
    if claims.allows_attachment(name) {
        Ok(())
    } else {
        gateway_log::info(
            module_path!(),
            format!("no permission to access attachment {name}"),
        );
        Err(AccessError::Forbidden)
    }
}
