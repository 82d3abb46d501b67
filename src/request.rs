//! Inbound request types.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;

use crate::context::{Context, ContextSlot};
use crate::route::RouteConfig;

/// A request as handed over by the transport: endpoint name, headers,
/// route configuration and an opaque payload.
///
/// The transport usually leaves `route_config` empty; the [`Router`](crate::Router)
/// fills it in from the matched endpoint.
#[derive(Clone, Debug)]
pub struct RequestEnvelope {
    pub(crate) name: String,
    pub(crate) headers: HeaderMap,
    pub(crate) route_config: Arc<RouteConfig>,
    pub(crate) payload: Bytes,
    pub(crate) params: HashMap<String, String>,
}

impl RequestEnvelope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            headers: HeaderMap::new(),
            route_config: Arc::default(),
            payload: Bytes::new(),
            params: HashMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Adds one header. Invalid names or values are ignored.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(name.as_bytes()),
            http::HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_route_config(mut self, config: impl Into<Arc<RouteConfig>>) -> Self {
        self.route_config = config.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn route_config(&self) -> &RouteConfig { &self.route_config }
    pub fn payload(&self) -> &Bytes { &self.payload }
}

/// The request as seen by wrap middleware and the final handler: the
/// envelope plus every capability merged by dynamic middleware.
#[derive(Debug)]
pub struct Request {
    envelope: RequestEnvelope,
    context: Context,
}

impl Request {
    pub(crate) fn new(envelope: RequestEnvelope, context: Context) -> Self {
        Self { envelope, context }
    }

    pub fn name(&self) -> &str { &self.envelope.name }
    pub fn headers(&self) -> &HeaderMap { &self.envelope.headers }
    pub fn route_config(&self) -> &RouteConfig { &self.envelope.route_config }
    pub fn payload(&self) -> &Bytes { &self.envelope.payload }
    pub fn context(&self) -> &Context { &self.context }

    /// Shorthand for `req.context().get(slot)`.
    pub fn get<T: 'static>(&self, slot: &ContextSlot<T>) -> Option<&T> {
        self.context.get(slot)
    }

    /// Case-insensitive header lookup. Non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.envelope.headers.get(name)?.to_str().ok()
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.envelope.params.get(key).map(String::as_str)
    }
}
