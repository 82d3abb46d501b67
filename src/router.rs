//! Endpoint router.
//!
//! Binds endpoint paths to a [`RouteConfig`] and a final handler, all
//! sharing one [`ExecutionPlan`]. The plan is composed when the router is
//! built; route configs are checked against the [`ContextMap`] as they are
//! registered. Build it once at startup, then call [`Router::handle`] from
//! as many tasks as you like.

use std::collections::HashMap;
use std::sync::Arc;

use matchit::Router as MatchitRouter;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::composer::{ExecutionPlan, compose};
use crate::context::ContextMap;
use crate::error::{CompositionError, RequestError, RouteError};
use crate::handler::{BoxedHandler, Handler, Outcome};
use crate::middleware::MiddlewareSpec;
use crate::request::RequestEnvelope;
use crate::route::RouteConfig;

struct Route {
    config: Arc<RouteConfig>,
    handler: BoxedHandler,
}

/// The application router.
pub struct Router {
    map: ContextMap,
    plan: ExecutionPlan,
    routes: MatchitRouter<Route>,
}

impl Router {
    /// Composes `specs` against `map`. Fails on any ordering problem.
    pub fn new(map: ContextMap, specs: Vec<MiddlewareSpec>) -> Result<Self, CompositionError> {
        let plan = compose(&map, specs)?;
        Ok(Self::with_plan(map, plan))
    }

    pub fn with_plan(map: ContextMap, plan: ExecutionPlan) -> Self {
        Self { map, plan, routes: MatchitRouter::new() }
    }

    /// Register a handler for a path. Returns `self` for chaining.
    ///
    /// Path parameters use `{name}` syntax; `req.param("name")` retrieves them:
    ///
    /// ```rust
    /// # use conduit::{Request, RequestError, Response, RouteConfig, Router, ContextMap};
    /// # async fn get_user(_: Request) -> Result<Response, RequestError> { Ok(Response::text("")) }
    /// # async fn health(_: Request) -> Result<Response, RequestError> { Ok(Response::text("")) }
    /// # fn main() -> Result<(), conduit::Error> {
    /// let router = Router::new(ContextMap::new(), Vec::new())?
    ///     .on("/users/{id}", RouteConfig::new(), get_user)?
    ///     .on("/healthz",    RouteConfig::new(), health)?;
    /// # Ok(()) }
    /// ```
    pub fn on(mut self, path: &str, config: RouteConfig, handler: impl Handler) -> Result<Self, RouteError> {
        config.validate(path, &self.map)?;
        let route = Route { config: Arc::new(config), handler: handler.into_boxed_handler() };
        self.routes
            .insert(path, route)
            .map_err(|source| RouteError::Path { path: path.to_owned(), source })?;
        debug!(path, "route registered");
        Ok(self)
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Routes one request by its name and runs it through the plan.
    pub async fn handle(&self, envelope: RequestEnvelope) -> Outcome {
        let (envelope, handler) = self.bind(envelope)?;
        self.plan.dispatch(envelope, handler).await
    }

    /// Like [`handle`](Self::handle), but stops with
    /// [`RequestError::Cancelled`] once `token` fires.
    pub async fn handle_until(&self, envelope: RequestEnvelope, token: &CancellationToken) -> Outcome {
        let (envelope, handler) = self.bind(envelope)?;
        self.plan.dispatch_until(envelope, handler, token).await
    }

    fn bind(&self, mut envelope: RequestEnvelope) -> Result<(RequestEnvelope, BoxedHandler), RequestError> {
        let matched = self
            .routes
            .at(&envelope.name)
            .map_err(|_| RequestError::RouteNotFound(envelope.name.clone()))?;
        let params: HashMap<String, String> = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        let route = matched.value;
        envelope.route_config = Arc::clone(&route.config);
        envelope.params = params;
        Ok((envelope, Arc::clone(&route.handler)))
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("plan", &self.plan).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::*;
    use crate::middleware::auth;
    use crate::request::Request;
    use crate::response::Response;

    async fn echo_id(req: Request) -> Result<Response, RequestError> {
        Ok(Response::text(req.param("id").unwrap_or("none").to_owned()))
    }

    fn router() -> Router {
        Router::new(auth::context_map().unwrap(), auth::specs())
            .unwrap()
            .on("/users/{id}", RouteConfig::new().set("allowAnonymous", true), echo_id)
            .unwrap()
    }

    #[tokio::test]
    async fn binds_params_and_route_config() {
        let response = router().handle(RequestEnvelope::new("/users/42")).await.unwrap();
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(&response.body()[..], b"42");
    }

    #[tokio::test]
    async fn unknown_route() {
        let err = router().handle(RequestEnvelope::new("/nope")).await.unwrap_err();
        assert_eq!(err, RequestError::RouteNotFound("/nope".into()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn route_configs_are_validated_at_registration() {
        let err = router()
            .on("/admin", RouteConfig::new().set("requireRoles", "admin"), echo_id)
            .unwrap_err();
        assert!(matches!(err, RouteError::Shape { slot: "requireRoles", .. }));

        let err = router()
            .on("/typo", RouteConfig::new().set("alowAnonymous", true), echo_id)
            .unwrap_err();
        assert!(matches!(err, RouteError::UnknownSlot { .. }));

        let err = router().on("/users/{id}", RouteConfig::new(), echo_id).unwrap_err();
        assert!(matches!(err, RouteError::Path { .. }));
    }

    #[test]
    fn composition_errors_abort_construction() {
        let specs = vec![MiddlewareSpec::dynamic(
            "RequireRoles",
            &auth::REQUIRE_ROLES,
            auth::RequireRoles,
        )
        .depends_on(["Authenticate"])];
        let err = Router::new(auth::context_map().unwrap(), specs).unwrap_err();
        assert!(matches!(err, CompositionError::MissingDependency { .. }));
    }
}
