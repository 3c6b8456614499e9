use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::ApiError;

/// The organisation the caller is acting as. Grounded on the teacher's
/// `AuthUser` extension type (`jwt_auth.rs`), narrowed to what this façade
/// actually needs: the auth/session machinery that would normally populate
/// this (JWT verification, Clerk, session cookies) is out of scope (§1
/// "External collaborators" — auth middleware is consumed, not built here).
/// This extractor trusts a pre-validated `X-Organisation-Id` header the way
/// a reverse-proxy or an upstream auth layer would set it after verifying a
/// session; no signature check happens in this crate.
#[derive(Debug, Clone, Copy)]
pub struct OrgContext {
    pub organisation_id: Uuid,
}

impl<S> FromRequestParts<S> for OrgContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("x-organisation-id")
            .ok_or(ApiError::Unauthorised)?
            .to_str()
            .map_err(|_| ApiError::Unauthorised)?;

        let organisation_id = Uuid::parse_str(header).map_err(|_| ApiError::Unauthorised)?;
        Ok(OrgContext { organisation_id })
    }
}
