use axum::{
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use tracing::trace;

use crate::api::{ApiState, error::AppError};

/// Proof that the request carried a token from `http.auth_tokens`. A no-op when
/// `HTTP_AUTH_TOKENS` is unset, matching the open-access-with-a-warning startup behavior.
pub struct AuthToken;

impl<S> FromRequestParts<S> for AuthToken
where
    S: Send + Sync,
    ApiState: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let api_state = ApiState::from_ref(state);

        let Some(tokens) = &api_state.config.http.auth_tokens else {
            return Ok(AuthToken);
        };

        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        match header {
            Some(token) if tokens.iter().any(|t| t == token) => {
                trace!("request authenticated via Authorization header");
                Ok(AuthToken)
            }
            _ => Err(AppError::Unauthorized),
        }
    }
}
