//! Caller identity extraction.
//!
//! Authentication happens upstream; the proxy in front of this service
//! forwards the authenticated user id in the `x-user-id` header.

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::api::error::ApiError;

/// Header carrying the authenticated user id.
pub const CALLER_HEADER: &str = "x-user-id";

/// Authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller(pub String);

impl Caller {
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        match value {
            Some(id) => Ok(Caller(id.to_string())),
            None => {
                tracing::debug!("Request without caller identity");
                Err(ApiError::unauthorized("Missing caller identity"))
            }
        }
    }
}
