//! Authorization slots.
//!
//! | Slot | Capability | Route config | On failure |
//! |---|---|---|---|
//! | `allowAnonymous` | [`Identity`] | `bool`, absent ⇒ `false` | 401 unauthenticated |
//! | `requireRoles` | `()` | `[String]`, absent ⇒ no check | 403 unauthorized |
//!
//! `requireRoles` reads the identity merged by `allowAnonymous`, so it is
//! registered with a dependency on it:
//!
//! ```rust
//! use conduit::middleware::auth;
//!
//! let map = auth::context_map().unwrap();
//! let plan = conduit::compose(&map, auth::specs()).unwrap();
//! assert_eq!(plan.order().collect::<Vec<_>>(), ["AllowAnonymous", "RequireRoles"]);
//! ```

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use http::HeaderMap;
use http::header::AUTHORIZATION;
use serde::Deserialize;
use tracing::warn;

use crate::context::{ConfigShape, ContextMap, ContextSlot, FailureKind};
use crate::error::{CompositionError, Rejection};
use crate::middleware::{Dynamic, DynamicInput, MiddlewareSpec};

pub const ALLOW_ANONYMOUS: ContextSlot<Identity> =
    ContextSlot::new("allowAnonymous", FailureKind::Unauthenticated, ConfigShape::Flag).always();

pub const REQUIRE_ROLES: ContextSlot<()> =
    ContextSlot::new("requireRoles", FailureKind::Unauthorized, ConfigShape::StringList);

/// Header carrying a JSON identity, for development and trusted proxies.
pub const USER_HEADER: &str = "x-user";

/// The authenticated caller.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Identity {
    pub sub: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Identity {
    pub fn new(sub: impl Into<String>, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { sub: sub.into(), roles: roles.into_iter().map(Into::into).collect() }
    }

    pub fn has_any_role<'a>(&self, required: impl IntoIterator<Item = &'a str>) -> bool {
        required.into_iter().any(|r| self.roles.iter().any(|have| have == r))
    }
}

/// The registry holding both authorization slots.
pub fn context_map() -> Result<ContextMap, CompositionError> {
    ContextMap::new().slot(&ALLOW_ANONYMOUS)?.slot(&REQUIRE_ROLES)
}

/// Both authorization middleware, identity read from [`USER_HEADER`].
pub fn specs() -> Vec<MiddlewareSpec> {
    vec![
        MiddlewareSpec::dynamic("RequireRoles", &REQUIRE_ROLES, RequireRoles).depends_on(["AllowAnonymous"]),
        MiddlewareSpec::dynamic("AllowAnonymous", &ALLOW_ANONYMOUS, AllowAnonymous::default()),
    ]
}

// ── AllowAnonymous ────────────────────────────────────────────────────────────

/// Where the identity is read from.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum IdentitySource {
    /// JSON object in the `x-user` header.
    #[default]
    UserHeader,
    /// Claims segment of an `Authorization: Bearer <jwt>` token. The token's
    /// signature must already have been verified upstream.
    BearerToken,
}

/// Provides [`Identity`]; fails unless the route sets `allowAnonymous: true`.
#[derive(Clone, Debug, Default)]
pub struct AllowAnonymous {
    source: IdentitySource,
}

impl AllowAnonymous {
    pub fn new(source: IdentitySource) -> Self {
        Self { source }
    }

    fn identity(&self, headers: &HeaderMap) -> Result<Option<Identity>, String> {
        match self.source {
            IdentitySource::UserHeader => match headers.get(USER_HEADER) {
                None => Ok(None),
                Some(raw) => serde_json::from_slice(raw.as_bytes()).map(Some).map_err(|e| e.to_string()),
            },
            IdentitySource::BearerToken => match headers.get(AUTHORIZATION) {
                None => Ok(None),
                Some(raw) => {
                    let raw = raw.to_str().map_err(|e| e.to_string())?;
                    let token = raw.strip_prefix("Bearer ").ok_or("not a bearer token")?;
                    identity_from_jwt(token).map(Some)
                }
            },
        }
    }
}

fn identity_from_jwt(token: &str) -> Result<Identity, String> {
    let claims = token.split('.').nth(1).ok_or("malformed token")?;
    let json = URL_SAFE_NO_PAD.decode(claims).map_err(|e| e.to_string())?;
    serde_json::from_slice(&json).map_err(|e| e.to_string())
}

impl Dynamic for AllowAnonymous {
    type Value = Identity;

    async fn provide(&self, input: DynamicInput<'_>) -> Result<Option<Identity>, Rejection> {
        let identity = self.identity(input.headers).unwrap_or_else(|error| {
            warn!(%error, source = ?self.source, "parsing identity failed");
            None
        });
        match identity {
            Some(identity) => Ok(Some(identity)),
            None if input.config.as_bool() == Some(true) => Ok(None),
            None => Err(Rejection::new("no auth")),
        }
    }
}

// ── RequireRoles ──────────────────────────────────────────────────────────────

/// Passes when the caller holds at least one of the configured roles.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequireRoles;

impl Dynamic for RequireRoles {
    type Value = ();

    async fn provide(&self, input: DynamicInput<'_>) -> Result<Option<()>, Rejection> {
        let required: Vec<&str> = input
            .config
            .as_array()
            .map(|roles| roles.iter().filter_map(|r| r.as_str()).collect())
            .unwrap_or_default();
        if required.is_empty() {
            return Ok(Some(()));
        }
        match input.context.get(&ALLOW_ANONYMOUS) {
            Some(identity) if identity.has_any_role(required.iter().copied()) => Ok(Some(())),
            Some(_) => Err(Rejection::new(format!("requires one of: {}", required.join(", ")))),
            None => Err(Rejection::new("role check without identity")),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::context::Context;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    fn input<'a>(config: &'a Value, headers: &'a HeaderMap, context: &'a Context) -> DynamicInput<'a> {
        DynamicInput { config, headers, context }
    }

    #[tokio::test]
    async fn identity_from_user_header() {
        let h = headers(&[(USER_HEADER, r#"{"sub":"u1","roles":["admin"]}"#)]);
        let got = AllowAnonymous::default()
            .provide(input(&Value::Null, &h, &Context::new()))
            .await
            .unwrap();
        assert_eq!(got, Some(Identity::new("u1", ["admin"])));
    }

    #[tokio::test]
    async fn missing_identity_is_rejected_unless_anonymous_allowed() {
        let h = HeaderMap::new();
        let ctx = Context::new();
        let mw = AllowAnonymous::default();

        assert!(mw.provide(input(&Value::Null, &h, &ctx)).await.is_err());
        assert!(mw.provide(input(&json!(false), &h, &ctx)).await.is_err());
        assert_eq!(mw.provide(input(&json!(true), &h, &ctx)).await, Ok(None));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn unparseable_identity_is_treated_as_absent() {
        let h = headers(&[(USER_HEADER, "not json")]);
        let got = AllowAnonymous::default()
            .provide(input(&json!(true), &h, &Context::new()))
            .await;
        assert_eq!(got, Ok(None));
        assert!(logs_contain("parsing identity failed"));
    }

    #[tokio::test]
    async fn identity_from_bearer_token() {
        let claims = URL_SAFE_NO_PAD.encode(r#"{"sub":"u7","roles":["user"]}"#);
        let token = format!("Bearer e30.{claims}.sig");
        let h = headers(&[("authorization", &token)]);
        let got = AllowAnonymous::new(IdentitySource::BearerToken)
            .provide(input(&Value::Null, &h, &Context::new()))
            .await
            .unwrap();
        assert_eq!(got, Some(Identity::new("u7", ["user"])));
    }

    #[tokio::test]
    async fn roles_must_intersect() {
        let h = HeaderMap::new();
        let mut ctx = Context::new();
        ctx.merge(ALLOW_ANONYMOUS.name(), std::sync::Arc::new(Identity::new("u1", ["user", "editor"])));
        let required = json!(["admin", "editor"]);

        assert_eq!(RequireRoles.provide(input(&required, &h, &ctx)).await, Ok(Some(())));
        assert!(RequireRoles.provide(input(&json!(["admin"]), &h, &ctx)).await.is_err());
        assert_eq!(RequireRoles.provide(input(&json!([]), &h, &ctx)).await, Ok(Some(())));
    }

    #[tokio::test]
    async fn roles_without_identity_are_rejected() {
        let h = HeaderMap::new();
        let got = RequireRoles.provide(input(&json!(["admin"]), &h, &Context::new())).await;
        assert_eq!(got, Err(Rejection::new("role check without identity")));
    }
}
