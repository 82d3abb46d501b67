//! Middleware model.
//!
//! Middleware comes in two kinds:
//!
//! - **dynamic** middleware ([`Dynamic`]) fills exactly one [`ContextSlot`].
//!   It is a function of the route's configuration for that slot, the
//!   request headers, and whatever earlier slots contributed. It returns a
//!   capability value, `None` to continue without one, or a [`Rejection`].
//! - **wrap** middleware ([`Wrap`]) intercepts the rest of the chain. It
//!   receives the merged request and a [`Next`] continuation, and may call
//!   `next.run(req)` or answer on its own.
//!
//! Both are registered as a [`MiddlewareSpec`] carrying a unique name and the
//! names of the specs it depends on. [`compose`](crate::compose) orders the
//! specs once, at startup.
//!
//! Built-in middleware:
//! - [`auth`]: the `allowAnonymous` / `requireRoles` slot pair
//! - [`trace`]: per-request span with name, outcome and latency

pub mod auth;
pub mod trace;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use http::HeaderMap;
use serde_json::Value;

use crate::context::{Context, ContextSlot, SlotInfo};
use crate::error::Rejection;
use crate::handler::{BoxedHandler, Outcome};
use crate::request::Request;

// ── Dynamic middleware ────────────────────────────────────────────────────────

/// Everything a dynamic middleware may look at.
#[derive(Clone, Copy)]
pub struct DynamicInput<'a> {
    /// The route's entry for this slot, or `null` when the route is silent
    /// and the slot is [`Presence::Always`](crate::Presence::Always).
    pub config: &'a Value,
    pub headers: &'a HeaderMap,
    /// Values merged by the dynamic middleware that ran before this one.
    pub context: &'a Context,
}

/// A middleware that contributes one context value.
pub trait Dynamic: Send + Sync + 'static {
    type Value: Send + Sync + 'static;

    fn provide(
        &self,
        input: DynamicInput<'_>,
    ) -> impl Future<Output = Result<Option<Self::Value>, Rejection>> + Send;
}

type Capability = Arc<dyn Any + Send + Sync>;

pub(crate) trait ErasedDynamic: Send + Sync {
    fn provide_erased<'a>(
        &'a self,
        input: DynamicInput<'a>,
    ) -> BoxFuture<'a, Result<Option<Capability>, Rejection>>;
}

impl<D: Dynamic> ErasedDynamic for D {
    fn provide_erased<'a>(
        &'a self,
        input: DynamicInput<'a>,
    ) -> BoxFuture<'a, Result<Option<Capability>, Rejection>> {
        Box::pin(async move {
            let value = self.provide(input).await?;
            Ok(value.map(|v| Arc::new(v) as Capability))
        })
    }
}

/// Adapts a synchronous closure into a [`Dynamic`] middleware.
///
/// ```rust
/// use conduit::middleware::{dynamic_fn, MiddlewareSpec};
/// use conduit::{ConfigShape, ContextSlot, FailureKind};
///
/// const LOCALE: ContextSlot<String> =
///     ContextSlot::new("locale", FailureKind::Invalid, ConfigShape::Flag);
///
/// let spec = MiddlewareSpec::dynamic("Locale", &LOCALE, dynamic_fn(|input| {
///     Ok(input.headers.get("accept-language")
///         .and_then(|v| v.to_str().ok())
///         .map(str::to_owned))
/// }));
/// assert_eq!(spec.name(), "Locale");
/// ```
pub fn dynamic_fn<F, T>(f: F) -> DynamicFn<F, T>
where
    F: Fn(DynamicInput<'_>) -> Result<Option<T>, Rejection> + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    DynamicFn { f, _value: PhantomData }
}

pub struct DynamicFn<F, T> {
    f: F,
    _value: PhantomData<fn() -> T>,
}

impl<F, T> Dynamic for DynamicFn<F, T>
where
    F: Fn(DynamicInput<'_>) -> Result<Option<T>, Rejection> + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    type Value = T;

    async fn provide(&self, input: DynamicInput<'_>) -> Result<Option<T>, Rejection> {
        (self.f)(input)
    }
}

// ── Wrap middleware ───────────────────────────────────────────────────────────

/// A middleware that intercepts the call to the next stage.
pub trait Wrap: Send + Sync + 'static {
    fn call(&self, req: Request, next: Next) -> impl Future<Output = Outcome> + Send;
}

pub(crate) trait ErasedWrap: Send + Sync {
    fn call_erased(&self, req: Request, next: Next) -> BoxFuture<'_, Outcome>;
}

impl<W: Wrap> ErasedWrap for W {
    fn call_erased(&self, req: Request, next: Next) -> BoxFuture<'_, Outcome> {
        Box::pin(self.call(req, next))
    }
}

/// Adapts an async closure into a [`Wrap`] middleware.
///
/// ```rust
/// use conduit::middleware::{wrap_fn, MiddlewareSpec};
///
/// let spec = MiddlewareSpec::wrap("Timing", wrap_fn(|req, next| async move {
///     next.run(req).await
/// }));
/// ```
pub fn wrap_fn<F, Fut>(f: F) -> WrapFn<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    WrapFn(f)
}

pub struct WrapFn<F>(F);

impl<F, Fut> Wrap for WrapFn<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    fn call(&self, req: Request, next: Next) -> impl Future<Output = Outcome> + Send {
        (self.0)(req, next)
    }
}

#[derive(Clone)]
pub(crate) struct WrapStage {
    pub(crate) name: String,
    pub(crate) wrap: Arc<dyn ErasedWrap>,
}

/// Continuation handed to a wrap middleware: the remaining wraps followed by
/// the final handler.
pub struct Next {
    stages: Arc<[WrapStage]>,
    position: usize,
    handler: BoxedHandler,
}

impl Next {
    pub(crate) fn new(stages: Arc<[WrapStage]>, handler: BoxedHandler) -> Self {
        Self { stages, position: 0, handler }
    }

    /// Runs the rest of the chain.
    pub fn run(mut self, req: Request) -> BoxFuture<'static, Outcome> {
        let stage = self.stages.get(self.position).cloned();
        match stage {
            Some(stage) => {
                self.position += 1;
                Box::pin(async move {
                    tracing::trace!(middleware = %stage.name, "wrap");
                    stage.wrap.call_erased(req, self).await
                })
            }
            None => {
                tracing::trace!("handler");
                self.handler.call(req)
            }
        }
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &(self.stages.len() - self.position))
            .finish()
    }
}

// ── MiddlewareSpec ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MiddlewareKind {
    Dynamic,
    Wrap,
}

pub(crate) enum Stage {
    Dynamic { slot: SlotInfo, provider: Arc<dyn ErasedDynamic> },
    Wrap(Arc<dyn ErasedWrap>),
}

/// A named middleware plus the names of the middleware it must run after.
pub struct MiddlewareSpec {
    pub(crate) name: String,
    pub(crate) depends_on: Vec<String>,
    pub(crate) stage: Stage,
}

impl MiddlewareSpec {
    /// A dynamic middleware providing `slot`.
    pub fn dynamic<D: Dynamic>(name: impl Into<String>, slot: &ContextSlot<D::Value>, provider: D) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            stage: Stage::Dynamic { slot: slot.info(), provider: Arc::new(provider) },
        }
    }

    pub fn wrap<W: Wrap>(name: impl Into<String>, wrap: W) -> Self {
        Self { name: name.into(), depends_on: Vec::new(), stage: Stage::Wrap(Arc::new(wrap)) }
    }

    /// Declares that this middleware runs after each of `names`.
    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MiddlewareKind {
        match self.stage {
            Stage::Dynamic { .. } => MiddlewareKind::Dynamic,
            Stage::Wrap(_) => MiddlewareKind::Wrap,
        }
    }

    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    /// The slot a dynamic middleware provides.
    pub fn slot(&self) -> Option<&SlotInfo> {
        match &self.stage {
            Stage::Dynamic { slot, .. } => Some(slot),
            Stage::Wrap(_) => None,
        }
    }
}

impl fmt::Debug for MiddlewareSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareSpec")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("slot", &self.slot().map(|s| s.name))
            .field("depends_on", &self.depends_on)
            .finish()
    }
}
