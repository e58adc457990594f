use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{Actor, Role};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing or wrong bearer token")]
    BadToken,
    #[error("missing {0} header")]
    Missing(&'static str),
    #[error("invalid {0} header")]
    Invalid(&'static str),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": "unauthorized", "message": self.to_string() });
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

/// Trusts the identity an upstream gateway attaches to each request. When a
/// token is configured, only callers presenting it are believed.
#[derive(Debug, Clone, Default)]
pub struct GatewayAuth {
    token: Option<String>,
}

impl GatewayAuth {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Actor, AuthError> {
        if let Some(expected) = &self.token {
            let presented = header_str(headers, header::AUTHORIZATION.as_str())
                .and_then(|v| v.strip_prefix("Bearer "));
            if presented != Some(expected.as_str()) {
                return Err(AuthError::BadToken);
            }
        }
        let user_id: Ulid = header_str(headers, USER_ID_HEADER)
            .ok_or(AuthError::Missing(USER_ID_HEADER))?
            .parse()
            .map_err(|_| AuthError::Invalid(USER_ID_HEADER))?;
        let role = match header_str(headers, USER_ROLE_HEADER) {
            Some(r) if r.eq_ignore_ascii_case("admin") => Role::Admin,
            Some(r) if r.eq_ignore_ascii_case("customer") => Role::Customer,
            Some(_) => return Err(AuthError::Invalid(USER_ROLE_HEADER)),
            None => return Err(AuthError::Missing(USER_ROLE_HEADER)),
        };
        Ok(Actor { user_id, role })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// The authenticated caller of a handler.
#[derive(Debug, Clone, Copy)]
pub struct CurrentActor(pub Actor);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentActor
where
    Arc<GatewayAuth>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = Arc::<GatewayAuth>::from_ref(state);
        let actor = auth.authenticate(&parts.headers)?;
        tracing::trace!(user_id = %actor.user_id, role = ?actor.role, "authenticated");
        Ok(CurrentActor(actor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn reads_identity_headers() {
        let id = Ulid::new();
        let auth = GatewayAuth::new(None);
        let actor = auth
            .authenticate(&headers(&[(USER_ID_HEADER, &id.to_string()), (USER_ROLE_HEADER, "Admin")]))
            .unwrap();
        assert_eq!(actor, Actor::admin(id));
    }

    #[test]
    fn rejects_missing_or_bad_headers() {
        let auth = GatewayAuth::new(None);
        assert_eq!(
            auth.authenticate(&headers(&[(USER_ROLE_HEADER, "customer")])),
            Err(AuthError::Missing(USER_ID_HEADER))
        );
        assert_eq!(
            auth.authenticate(&headers(&[(USER_ID_HEADER, "nope"), (USER_ROLE_HEADER, "customer")])),
            Err(AuthError::Invalid(USER_ID_HEADER))
        );
        let id = Ulid::new().to_string();
        assert_eq!(
            auth.authenticate(&headers(&[(USER_ID_HEADER, &id), (USER_ROLE_HEADER, "root")])),
            Err(AuthError::Invalid(USER_ROLE_HEADER))
        );
    }

    #[test]
    fn token_is_required_when_configured() {
        let auth = GatewayAuth::new(Some("s3cret".into()));
        let id = Ulid::new().to_string();
        let base = [(USER_ID_HEADER, id.as_str()), (USER_ROLE_HEADER, "customer")];
        assert_eq!(auth.authenticate(&headers(&base)), Err(AuthError::BadToken));

        let mut with_token = headers(&base);
        with_token.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert!(auth.authenticate(&with_token).is_ok());
    }
}
