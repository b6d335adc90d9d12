//! Session context for authenticated endpoints.
//!
//! The chat platform's identity layer supplies a user identifier and an
//! init-data token; both are opaque here. The context is an explicit value
//! handed to handlers and to the client agent, never ambient process state.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::{ApiError, ApiErrorWithMeta, E_UNAUTHENTICATED};
use crate::responses::{RequestMeta, new_meta};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const INIT_DATA_HEADER: &str = "x-init-data";

#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Opaque identifier from the platform's session layer.
    pub user_id: String,
    /// Opaque authentication token; verified upstream, carried through here.
    pub init_data: String,
}

impl SessionContext {
    pub fn new(user_id: impl Into<String>, init_data: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            init_data: init_data.into(),
        }
    }
}

impl<S> FromRequestParts<S> for SessionContext
where
    S: Send + Sync,
{
    type Rejection = ApiErrorWithMeta;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let meta = parts
            .extensions
            .get::<RequestMeta>()
            .cloned()
            .unwrap_or_else(new_meta);

        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let user_id = header(USER_ID_HEADER);
        let init_data = header(INIT_DATA_HEADER);
        match (user_id, init_data) {
            (Some(user_id), Some(init_data)) => Ok(SessionContext { user_id, init_data }),
            _ => Err(ApiError::Unauthorized("missing session headers".into())
                .with_meta(meta)
                .with_code(E_UNAUTHENTICATED)),
        }
    }
}
