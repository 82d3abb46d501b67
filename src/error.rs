//! Error taxonomy.
//!
//! Two families live here. Startup failures ([`CompositionError`],
//! [`RouteError`], [`ConfigError`]) are fatal and abort construction of the
//! application; [`Error`] unifies them for `main`. Everything that can go
//! wrong while serving a request is a [`RequestError`]: an ordinary value
//! carried back through the middleware chain, never a panic.
//!
//! The data-access layer has its own per-key and per-fingerprint errors
//! ([`LookupError`], [`CacheError`]). Both are `Clone` because one outcome
//! fans out to every caller waiting on the same key.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use http::StatusCode;
use thiserror::Error;

use crate::context::{ConfigShape, FailureKind};
use crate::response::Response;

/// Startup error: anything that prevents the application from being built.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Composition(#[from] CompositionError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ── Composition ───────────────────────────────────────────────────────────────

/// The middleware set cannot be ordered into an execution plan.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CompositionError {
    #[error("middleware `{0}` is registered more than once")]
    DuplicateSpec(String),

    #[error("context slot `{0}` is registered more than once")]
    DuplicateSlot(&'static str),

    #[error("middleware `{spec}` depends on `{dependency}`, which is not registered")]
    MissingDependency { spec: String, dependency: String },

    #[error("middleware `{spec}` provides slot `{slot}`, which the context map does not declare")]
    UnknownSlot { spec: String, slot: &'static str },

    #[error("slot `{slot}` is provided by both `{first}` and `{second}`")]
    SlotTaken { slot: &'static str, first: String, second: String },

    #[error("dynamic middleware `{spec}` cannot depend on wrap middleware `{dependency}`")]
    WrapDependency { spec: String, dependency: String },

    #[error("dependency cycle between {}", .0.join(", "))]
    Cycle(Vec<String>),
}

// ── Routing ───────────────────────────────────────────────────────────────────

/// A route could not be registered.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid route `{path}`: {source}")]
    Path {
        path: String,
        #[source]
        source: matchit::InsertError,
    },

    #[error("route `{path}` configures unknown slot `{slot}`")]
    UnknownSlot { path: String, slot: String },

    #[error("route `{path}` configures slot `{slot}` with a value that is not {expected}")]
    Shape { path: String, slot: &'static str, expected: ConfigShape },
}

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid settings: {0}")]
    Toml(#[from] toml::de::Error),
}

// ── Per-request failures ──────────────────────────────────────────────────────

/// Failure returned by a dynamic middleware.
///
/// A rejection carries only a message; the composer tags it with the
/// [`FailureKind`] of the slot the middleware provides, so every failure is
/// attributable to exactly one slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    message: Cow<'static, str>,
}

impl Rejection {
    pub fn new(message: impl Into<Cow<'static, str>>) -> Self {
        Self { message: message.into() }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn into_request_error(self, slot: &'static str, kind: FailureKind) -> RequestError {
        let message = self.message;
        match kind {
            FailureKind::Unauthenticated => RequestError::Unauthenticated { slot, message },
            FailureKind::Unauthorized => RequestError::Unauthorized { slot, message },
            FailureKind::Invalid => RequestError::Invalid { slot, message },
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Typed outcome of a failed request.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("not logged in: {message}")]
    Unauthenticated { slot: &'static str, message: Cow<'static, str> },

    #[error("unauthorized: {message}")]
    Unauthorized { slot: &'static str, message: Cow<'static, str> },

    #[error("invalid request: {message}")]
    Invalid { slot: &'static str, message: Cow<'static, str> },

    #[error("{0} not found")]
    NotFound(String),

    #[error("no route for `{0}`")]
    RouteNotFound(String),

    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Defect(String),
}

impl RequestError {
    /// The slot whose middleware produced this failure, if any.
    pub fn slot(&self) -> Option<&'static str> {
        match self {
            Self::Unauthenticated { slot, .. }
            | Self::Unauthorized { slot, .. }
            | Self::Invalid { slot, .. } => Some(slot),
            _ => None,
        }
    }

    /// Stable machine-readable tag, used as the `error` field on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated { .. } => "unauthenticated",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Invalid { .. } => "invalid",
            Self::NotFound(_) => "not_found",
            Self::RouteNotFound(_) => "route_not_found",
            Self::Unavailable(_) => "unavailable",
            Self::Cancelled => "cancelled",
            Self::Defect(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Self::Unauthorized { .. } => StatusCode::FORBIDDEN,
            Self::Invalid { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound(_) | Self::RouteNotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            // nginx's "client closed request"
            Self::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            Self::Defect(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Serializes the failure for the caller. Defects never leak their
    /// message; it has already been logged where the defect was caught.
    pub fn into_response(self) -> Response {
        let message = match &self {
            Self::Defect(_) => "internal error".to_owned(),
            other => other.to_string(),
        };
        let body = serde_json::json!({ "error": self.kind(), "message": message });
        Response::builder()
            .status(self.status())
            .json(serde_json::to_vec(&body).unwrap_or_default())
    }
}

impl<K: fmt::Debug, E: fmt::Display> From<LookupError<K, E>> for RequestError {
    fn from(e: LookupError<K, E>) -> Self {
        match e {
            LookupError::NotFound(key) => Self::NotFound(format!("{key:?}")),
            LookupError::BackingStore(source) => Self::Unavailable(source.to_string()),
            LookupError::Defect(message) => Self::Defect(message),
        }
    }
}

// ── Data access ───────────────────────────────────────────────────────────────

/// Outcome of a failed per-key lookup through the batching resolver.
#[derive(Debug, Error)]
pub enum LookupError<K, E> {
    /// The store answered, but the answer did not contain this key.
    #[error("{0:?} not found")]
    NotFound(K),

    /// The aggregate query failed. Every request in the batch receives the
    /// same `Arc`.
    #[error("backing store failed: {0}")]
    BackingStore(Arc<E>),

    /// The dispatch panicked or was torn down before completing.
    #[error("lookup aborted: {0}")]
    Defect(String),
}

impl<K: Clone, E> Clone for LookupError<K, E> {
    fn clone(&self) -> Self {
        match self {
            Self::NotFound(key) => Self::NotFound(key.clone()),
            Self::BackingStore(source) => Self::BackingStore(Arc::clone(source)),
            Self::Defect(message) => Self::Defect(message.clone()),
        }
    }
}

/// Store failures compare by identity: two callers observed the same
/// failure only if they hold the same `Arc`.
impl<K: PartialEq, E> PartialEq for LookupError<K, E> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::NotFound(a), Self::NotFound(b)) => a == b,
            (Self::BackingStore(a), Self::BackingStore(b)) => Arc::ptr_eq(a, b),
            (Self::Defect(a), Self::Defect(b)) => a == b,
            _ => false,
        }
    }
}

/// Outcome of a failed cache computation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CacheError<E> {
    #[error("{0}")]
    Compute(E),

    #[error("computation aborted: {0}")]
    Defect(String),
}

/// Renders a caught panic payload for logs and `Defect` messages.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_owned()
    }
}
