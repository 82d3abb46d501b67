//! # conduit
//!
//! The request-processing core of a backend service: a dependency-ordered
//! middleware chain in front of your handlers, and a batching, caching
//! data-access layer behind them.
//!
//! ## The contract
//!
//! conduit does not speak HTTP. A transport (hyper, axum, a queue consumer)
//! turns its input into a [`RequestEnvelope`] and hands it to a [`Router`];
//! it gets back a [`Response`] or a typed [`RequestError`] that already knows
//! its status code.
//!
//! What conduit owns:
//!
//! - **Declarative per-route policy**: routes carry a [`RouteConfig`] of
//!   slot-keyed flags (`allowAnonymous`, `requireRoles`, …), interpreted by
//!   dynamic middleware, one [`ContextSlot`] each
//! - **Ordering checked at startup**: middleware declare what they depend
//!   on; [`compose`] sorts them once and rejects cycles and dangling names
//!   before the first request
//! - **Batched lookups**: [`BatchingResolver`] folds concurrent per-key
//!   lookups into one store call per batch
//! - **Single-flight caching**: [`RequestCache`] memoizes by [`Fingerprint`]
//!   with TTL and capacity bounds, one computation per fingerprint
//!
//! ## Quick start
//!
//! ```rust
//! use conduit::middleware::{MiddlewareSpec, auth, trace::Trace};
//! use conduit::{Request, RequestEnvelope, RequestError, Response, RouteConfig, Router};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), conduit::Error> {
//! let mut specs = auth::specs();
//! specs.push(MiddlewareSpec::wrap("Trace", Trace));
//!
//! let app = Router::new(auth::context_map()?, specs)?
//!     .on("/me", RouteConfig::new(), me)?
//!     .on("/admin/stats", RouteConfig::new().set("requireRoles", vec!["admin"]), me)?;
//!
//! let envelope = RequestEnvelope::new("/me").header("x-user", r#"{"sub":"u1","roles":[]}"#);
//! let response = app.handle(envelope).await.unwrap_or_else(RequestError::into_response);
//! assert_eq!(response.status_code(), 200);
//! # Ok(()) }
//!
//! async fn me(req: Request) -> Result<Response, RequestError> {
//!     let identity = req.get(&auth::ALLOW_ANONYMOUS).ok_or(RequestError::Defect("no identity".into()))?;
//!     Ok(Response::text(identity.sub.clone()))
//! }
//! ```

mod cache;
mod composer;
mod config;
mod context;
mod error;
mod handler;
mod loader;
mod request;
mod resolver;
mod response;
mod route;
mod router;

pub mod middleware;

pub use cache::{Fingerprint, RequestCache};
pub use composer::{ExecutionPlan, compose};
pub use config::{BatchConfig, CacheConfig, Settings};
pub use context::{ConfigShape, Context, ContextMap, ContextSlot, FailureKind, Presence, SlotInfo};
pub use error::{
    CacheError, CompositionError, ConfigError, Error, LookupError, Rejection, RequestError, RouteError,
};
pub use handler::{Handler, Outcome};
pub use loader::Loader;
pub use request::{Request, RequestEnvelope};
pub use resolver::{BatchingResolver, Lookup, Store};
pub use response::{IntoResponse, Response, ResponseBuilder};
pub use route::RouteConfig;
pub use router::Router;
