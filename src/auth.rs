use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::api::error::ApiError;

/// Shared bearer token checked by [`require_bearer`]. Only its digest is kept, so
/// comparisons take the same time whatever the length of the presented token.
#[derive(Clone)]
pub struct AuthConfig {
    digest: Arc<[u8; 32]>,
}

impl AuthConfig {
    pub fn new(token: &str) -> Self {
        Self {
            digest: Arc::new(Sha256::digest(token.as_bytes()).into()),
        }
    }

    fn accepts(&self, header: &str) -> bool {
        let Some(presented) = header.strip_prefix("Bearer ") else {
            return false;
        };
        let presented = Sha256::digest(presented.trim().as_bytes());
        presented.as_slice().ct_eq(self.digest.as_slice()).into()
    }
}

/// Rejects requests without `Authorization: Bearer <token>`
pub async fn require_bearer(
    State(auth): State<AuthConfig>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| auth.accepts(v));
    if !authorized {
        tracing::debug!(path = %request.uri().path(), "rejected unauthenticated request");
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}
