use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AccountClaims {
    pub sub: String, // Account ID (Subject)
    pub name: Option<String>,
    pub roles: Option<Vec<String>>,
    pub exp: usize, // Expiration time (UNIX timestamp)
}

#[derive(Clone, Debug)]
pub struct PrincipalContext {
    pub account_id: String,
    pub claims: AccountClaims,
}

/// Extractor for the principal injected by the auth middleware. `None`
/// when authentication is disabled and no token was presented.
#[derive(Debug)]
pub struct Principal(pub Option<PrincipalContext>);

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<PrincipalContext>().cloned()))
    }
}
