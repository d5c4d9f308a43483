use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use super::api::ApiError;

/// Header carrying the verified user id, set by the authentication layer in
/// front of this service.
pub const CALLER_HEADER: &str = "x-user-id";

/// The authenticated caller of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub Uuid);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        Uuid::parse_str(raw.trim())
            .map(Caller)
            .map_err(|_| ApiError::Unauthorized)
    }
}
