//! Middleware composition and execution.
//!
//! [`compose`] validates a set of [`MiddlewareSpec`]s and sorts them into an
//! [`ExecutionPlan`]. It runs once, at startup; every ordering mistake
//! (cycles, missing dependencies, unknown slots) is reported there rather
//! than on some later request.
//!
//! Per request, the plan runs every dynamic middleware in order, merging
//! each contributed value into the request [`Context`], then hands the
//! merged request to the wrap middleware chain, which ends in the final
//! handler:
//!
//! ```text
//! NotStarted ─▶ dynamic[0] ─▶ … ─▶ dynamic[n] ─▶ wrap[0] ─▶ … ─▶ handler ─▶ Success
//!                   │                  │            │                │
//!                   └──────────────────┴────────────┴────────────────┴────▶ Failed
//! ```
//!
//! A dynamic middleware's value is merged only after it succeeds, and the
//! context lives inside the request's own future, so a cancelled request
//! leaves nothing half-applied behind.

use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, trace};

use crate::context::{Context, ContextMap, Presence, SlotInfo};
use crate::error::{CompositionError, RequestError, panic_message};
use crate::handler::{BoxedHandler, Handler, Outcome};
use crate::middleware::{ErasedDynamic, MiddlewareKind, MiddlewareSpec, Next, Stage, WrapStage};
use crate::request::{Request, RequestEnvelope};

/// Config seen by an [`Presence::Always`] slot on a route that is silent about it.
static UNCONFIGURED: Value = Value::Null;

struct DynamicStage {
    name: String,
    slot: SlotInfo,
    provider: Arc<dyn ErasedDynamic>,
}

/// The fixed, dependency-sorted order middleware runs in.
///
/// Immutable once built; share it across tasks behind an `Arc`.
pub struct ExecutionPlan {
    order: Vec<String>,
    dynamics: Box<[DynamicStage]>,
    wraps: Arc<[WrapStage]>,
}

/// Validates `specs` against `map` and orders them.
///
/// Ordering is a stable topological sort: among the specs whose
/// dependencies are satisfied, the one registered first runs first. All
/// dynamic middleware precede all wrap middleware, so a dynamic spec may not
/// depend on a wrap spec.
pub fn compose(map: &ContextMap, specs: Vec<MiddlewareSpec>) -> Result<ExecutionPlan, CompositionError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        if index.insert(spec.name(), i).is_some() {
            return Err(CompositionError::DuplicateSpec(spec.name.clone()));
        }
    }

    let mut providers: HashMap<&'static str, &str> = HashMap::new();
    for spec in &specs {
        let Some(slot) = spec.slot() else { continue };
        let registered = map.get(slot.name).is_some_and(|s| s.capability == slot.capability);
        if !registered {
            return Err(CompositionError::UnknownSlot { spec: spec.name.clone(), slot: slot.name });
        }
        if let Some(first) = providers.insert(slot.name, spec.name()) {
            return Err(CompositionError::SlotTaken {
                slot: slot.name,
                first: first.to_owned(),
                second: spec.name.clone(),
            });
        }
    }

    // dependencies[i]: distinct indices spec i waits for
    let mut dependencies: Vec<BTreeSet<usize>> = Vec::with_capacity(specs.len());
    for spec in &specs {
        let mut deps = BTreeSet::new();
        for name in spec.dependencies() {
            let &j = index.get(name.as_str()).ok_or_else(|| CompositionError::MissingDependency {
                spec: spec.name.clone(),
                dependency: name.clone(),
            })?;
            if spec.kind() == MiddlewareKind::Dynamic && specs[j].kind() == MiddlewareKind::Wrap {
                return Err(CompositionError::WrapDependency {
                    spec: spec.name.clone(),
                    dependency: name.clone(),
                });
            }
            deps.insert(j);
        }
        dependencies.push(deps);
    }

    let order = topological_order(&dependencies).map_err(|stuck| {
        CompositionError::Cycle(stuck.into_iter().map(|i| specs[i].name.clone()).collect())
    })?;

    let mut specs: Vec<Option<MiddlewareSpec>> = specs.into_iter().map(Some).collect();
    let mut dynamics = Vec::new();
    let mut wraps = Vec::new();
    for i in order {
        let Some(spec) = specs[i].take() else { continue };
        match spec.stage {
            Stage::Dynamic { slot, provider } => dynamics.push(DynamicStage { name: spec.name, slot, provider }),
            Stage::Wrap(wrap) => wraps.push(WrapStage { name: spec.name, wrap }),
        }
    }
    // Dynamics run as one block before the wraps.
    let order: Vec<String> = dynamics
        .iter()
        .map(|d| d.name.clone())
        .chain(wraps.iter().map(|w| w.name.clone()))
        .collect();

    debug!(order = ?order, "composed execution plan");
    Ok(ExecutionPlan { order, dynamics: dynamics.into(), wraps: wraps.into() })
}

/// Kahn's algorithm, always taking the lowest ready index.
///
/// On a cycle, returns the specs that sit on or between cycles, in
/// registration order.
fn topological_order(dependencies: &[BTreeSet<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let n = dependencies.len();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut waiting: Vec<usize> = Vec::with_capacity(n);
    for (i, deps) in dependencies.iter().enumerate() {
        waiting.push(deps.len());
        for &d in deps {
            dependents[d].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| waiting[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            waiting[d] -= 1;
            if waiting[d] == 0 {
                ready.insert(d);
            }
        }
    }
    if order.len() == n {
        return Ok(order);
    }

    // Strip specs that merely depend on a cycle: repeatedly drop any
    // remaining spec nothing else remaining depends on.
    let mut remaining: BTreeSet<usize> = (0..n).filter(|&i| waiting[i] > 0).collect();
    loop {
        let sinks: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&i| !dependents[i].iter().any(|d| remaining.contains(d)))
            .collect();
        if sinks.is_empty() {
            break;
        }
        for i in sinks {
            remaining.remove(&i);
        }
    }
    Err(remaining.into_iter().collect())
}

impl ExecutionPlan {
    /// Middleware names in execution order.
    pub fn order(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Runs `envelope` through the plan, ending in `handler`.
    pub async fn execute(&self, envelope: RequestEnvelope, handler: impl Handler) -> Outcome {
        self.dispatch(envelope, handler.into_boxed_handler()).await
    }

    /// Like [`execute`](Self::execute), but gives up with
    /// [`RequestError::Cancelled`] once `token` is cancelled. Work this
    /// request shares with others (batches, cache computations) keeps running.
    pub async fn execute_until(
        &self,
        envelope: RequestEnvelope,
        handler: impl Handler,
        token: &CancellationToken,
    ) -> Outcome {
        self.dispatch_until(envelope, handler.into_boxed_handler(), token).await
    }

    pub(crate) async fn dispatch_until(
        &self,
        envelope: RequestEnvelope,
        handler: BoxedHandler,
        token: &CancellationToken,
    ) -> Outcome {
        let name = envelope.name.clone();
        tokio::select! {
            biased;

            () = token.cancelled() => {
                debug!(%name, "request cancelled");
                Err(RequestError::Cancelled)
            }
            outcome = self.dispatch(envelope, handler) => outcome,
        }
    }

    /// Runs the request and turns a panic anywhere in the chain into a
    /// [`RequestError::Defect`] for this request alone.
    pub(crate) async fn dispatch(&self, envelope: RequestEnvelope, handler: BoxedHandler) -> Outcome {
        let span = info_span!("request", name = %envelope.name);
        AssertUnwindSafe(self.run(envelope, handler))
            .catch_unwind()
            .instrument(span.clone())
            .await
            .unwrap_or_else(|payload| {
                let message = panic_message(&*payload);
                span.in_scope(|| error!(%message, "request panicked"));
                Err(RequestError::Defect(message))
            })
    }

    async fn run(&self, envelope: RequestEnvelope, handler: BoxedHandler) -> Outcome {
        let mut context = Context::new();

        for stage in self.dynamics.iter() {
            let config = match envelope.route_config.get(stage.slot.name) {
                Some(config) => config,
                None if stage.slot.presence == Presence::Always => &UNCONFIGURED,
                None => {
                    trace!(middleware = %stage.name, "slot not configured");
                    continue;
                }
            };
            let input = crate::middleware::DynamicInput {
                config,
                headers: &envelope.headers,
                context: &context,
            };
            match stage.provider.provide_erased(input).await {
                Ok(Some(value)) => {
                    trace!(middleware = %stage.name, slot = stage.slot.name, "merged");
                    context.merge(stage.slot.name, value);
                }
                Ok(None) => trace!(middleware = %stage.name, slot = stage.slot.name, "no capability"),
                Err(rejection) => {
                    debug!(middleware = %stage.name, slot = stage.slot.name, %rejection, "rejected");
                    return Err(rejection.into_request_error(stage.slot.name, stage.slot.failure));
                }
            }
        }

        Next::new(Arc::clone(&self.wraps), handler)
            .run(Request::new(envelope, context))
            .await
    }
}

impl std::fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPlan").field("order", &self.order).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use http::StatusCode;
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::context::{ConfigShape, ContextSlot, FailureKind};
    use crate::error::Rejection;
    use crate::middleware::{dynamic_fn, wrap_fn};
    use crate::response::Response;
    use crate::route::RouteConfig;

    const FIRST: ContextSlot<u32> =
        ContextSlot::new("first", FailureKind::Unauthenticated, ConfigShape::Any).always();
    const SECOND: ContextSlot<u32> = ContextSlot::new("second", FailureKind::Invalid, ConfigShape::Any);

    type Log = Arc<Mutex<Vec<String>>>;

    fn map() -> ContextMap {
        ContextMap::new().slot(&FIRST).unwrap().slot(&SECOND).unwrap()
    }

    fn passthrough(name: &str) -> MiddlewareSpec {
        MiddlewareSpec::wrap(name, wrap_fn(|req, next| next.run(req)))
    }

    fn logging_wrap(name: &'static str, log: &Log) -> MiddlewareSpec {
        let log = Arc::clone(log);
        MiddlewareSpec::wrap(
            name,
            wrap_fn(move |req, next| {
                log.lock().unwrap().push(name.to_owned());
                next.run(req)
            }),
        )
    }

    fn names(plan: &ExecutionPlan) -> Vec<&str> {
        plan.order().collect()
    }

    async fn ok(_req: Request) -> Result<Response, RequestError> {
        Ok(Response::text("ok"))
    }

    #[test]
    fn orders_by_dependency_then_registration() {
        let specs = vec![
            passthrough("c").depends_on(["b"]),
            passthrough("a"),
            passthrough("b").depends_on(["a"]),
            passthrough("d"),
        ];
        let plan = compose(&map(), specs).unwrap();
        assert_eq!(names(&plan), ["a", "b", "c", "d"]);
    }

    #[test]
    fn dynamics_precede_wraps() {
        let specs = vec![
            passthrough("trace"),
            MiddlewareSpec::dynamic("second", &SECOND, dynamic_fn(|_| Ok(Some(2)))).depends_on(["first"]),
            MiddlewareSpec::dynamic("first", &FIRST, dynamic_fn(|_| Ok(Some(1)))),
        ];
        let plan = compose(&map(), specs).unwrap();
        assert_eq!(names(&plan), ["first", "second", "trace"]);
    }

    #[test]
    fn rejects_invalid_spec_sets() {
        let err = compose(&map(), vec![passthrough("a"), passthrough("a")]).unwrap_err();
        assert_eq!(err, CompositionError::DuplicateSpec("a".into()));

        let err = compose(&map(), vec![passthrough("a").depends_on(["ghost"])]).unwrap_err();
        assert_eq!(
            err,
            CompositionError::MissingDependency { spec: "a".into(), dependency: "ghost".into() }
        );

        const STRAY: ContextSlot<u32> = ContextSlot::new("stray", FailureKind::Invalid, ConfigShape::Any);
        let err = compose(&map(), vec![MiddlewareSpec::dynamic("s", &STRAY, dynamic_fn(|_| Ok(None)))])
            .unwrap_err();
        assert_eq!(err, CompositionError::UnknownSlot { spec: "s".into(), slot: "stray" });

        let err = compose(
            &map(),
            vec![
                MiddlewareSpec::dynamic("one", &FIRST, dynamic_fn(|_| Ok(None))),
                MiddlewareSpec::dynamic("two", &FIRST, dynamic_fn(|_| Ok(None))),
            ],
        )
        .unwrap_err();
        assert_eq!(
            err,
            CompositionError::SlotTaken { slot: "first", first: "one".into(), second: "two".into() }
        );

        let err = compose(
            &map(),
            vec![
                passthrough("trace"),
                MiddlewareSpec::dynamic("first", &FIRST, dynamic_fn(|_| Ok(None))).depends_on(["trace"]),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, CompositionError::WrapDependency { .. }));
    }

    #[test]
    fn cycles_are_reported_without_their_dependents() {
        let specs = vec![
            passthrough("a").depends_on(["b"]),
            passthrough("b").depends_on(["a"]),
            passthrough("c").depends_on(["a"]),
            passthrough("d"),
        ];
        let err = compose(&map(), specs).unwrap_err();
        assert_eq!(err, CompositionError::Cycle(vec!["a".into(), "b".into()]));

        let err = compose(&map(), vec![passthrough("self").depends_on(["self"])]).unwrap_err();
        assert_eq!(err, CompositionError::Cycle(vec!["self".into()]));
    }

    #[tokio::test]
    async fn runs_dynamics_then_wraps_in_plan_order() {
        let log: Log = Arc::default();
        let dyn_log = Arc::clone(&log);
        let specs = vec![
            logging_wrap("outer", &log).depends_on(["first"]),
            logging_wrap("inner", &log).depends_on(["outer"]),
            MiddlewareSpec::dynamic(
                "first",
                &FIRST,
                dynamic_fn(move |_| {
                    dyn_log.lock().unwrap().push("first".into());
                    Ok(Some(1))
                }),
            ),
        ];
        let plan = compose(&map(), specs).unwrap();

        let handler_log = Arc::clone(&log);
        let response = plan
            .execute(RequestEnvelope::new("/x"), move |req: Request| {
                let log = Arc::clone(&handler_log);
                async move {
                    log.lock().unwrap().push("handler".into());
                    assert_eq!(req.get(&FIRST), Some(&1));
                    assert!(req.get(&SECOND).is_none());
                    Ok::<_, RequestError>("done")
                }
            })
            .await
            .unwrap();

        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(*log.lock().unwrap(), ["first", "outer", "inner", "handler"]);
    }

    #[tokio::test]
    async fn dynamic_sees_earlier_values_and_route_config() {
        let specs = vec![
            MiddlewareSpec::dynamic("first", &FIRST, dynamic_fn(|_| Ok(Some(20)))),
            MiddlewareSpec::dynamic(
                "second",
                &SECOND,
                dynamic_fn(|input| {
                    let base = input.context.get(&FIRST).copied().unwrap_or_default();
                    let add = input.config.as_u64().unwrap_or_default() as u32;
                    Ok(Some(base + add))
                }),
            )
            .depends_on(["first"]),
        ];
        let plan = compose(&map(), specs).unwrap();
        let envelope = RequestEnvelope::new("/x").with_route_config(RouteConfig::new().set("second", json!(3)));

        let response = plan
            .execute(envelope, |req: Request| async move {
                Ok::<_, RequestError>(req.get(&SECOND).copied().unwrap_or_default().to_string())
            })
            .await
            .unwrap();
        assert_eq!(&response.body()[..], b"23");
    }

    #[tokio::test]
    async fn unconfigured_optional_slot_is_skipped() {
        let specs = vec![MiddlewareSpec::dynamic(
            "second",
            &SECOND,
            dynamic_fn(|_| -> Result<Option<u32>, Rejection> { panic!("must not run") }),
        )];
        let plan = compose(&map(), specs).unwrap();
        assert!(plan.execute(RequestEnvelope::new("/x"), ok).await.is_ok());
    }

    #[tokio::test]
    async fn first_rejection_short_circuits() {
        let log: Log = Arc::default();
        let later = Arc::clone(&log);
        let specs = vec![
            MiddlewareSpec::dynamic("first", &FIRST, dynamic_fn(|_| Err(Rejection::new("no auth")))),
            MiddlewareSpec::dynamic(
                "second",
                &SECOND,
                dynamic_fn(move |_| {
                    later.lock().unwrap().push("second".into());
                    Ok(Some(2))
                }),
            )
            .depends_on(["first"]),
            logging_wrap("wrap", &log),
        ];
        let plan = compose(&map(), specs).unwrap();
        let envelope = RequestEnvelope::new("/x").with_route_config(RouteConfig::new().set("second", true));

        let err = plan.execute(envelope, ok).await.unwrap_err();
        assert_eq!(
            err,
            RequestError::Unauthenticated { slot: "first", message: "no auth".into() }
        );
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrap_can_answer_without_calling_next() {
        let specs = vec![MiddlewareSpec::wrap(
            "gate",
            wrap_fn(|_req, _next| async { Ok(Response::status(StatusCode::TOO_MANY_REQUESTS)) }),
        )];
        let plan = compose(&map(), specs).unwrap();
        let response = plan
            .execute(RequestEnvelope::new("/x"), |_req: Request| async {
                Err::<Response, _>(RequestError::Defect("handler must not run".into()))
            })
            .await
            .unwrap();
        assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn panics_become_defects() {
        let plan = compose(&map(), Vec::new()).unwrap();
        let err = plan
            .execute(RequestEnvelope::new("/x"), |_req: Request| async {
                if true {
                    panic!("handler bug");
                }
                Ok::<_, RequestError>("unreachable")
            })
            .await
            .unwrap_err();
        assert_eq!(err, RequestError::Defect("handler bug".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_request() {
        let plan = compose(&map(), vec![passthrough("trace")]).unwrap();
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = plan
            .execute_until(
                RequestEnvelope::new("/slow"),
                |_req: Request| async {
                    std::future::pending::<()>().await;
                    Ok::<_, RequestError>("never")
                },
                &token,
            )
            .await
            .unwrap_err();
        assert_eq!(err, RequestError::Cancelled);
    }

    /// A random DAG: node `i` may depend only on nodes `< i`, registered in
    /// a shuffled order.
    fn dag() -> impl Strategy<Value = (Vec<Vec<usize>>, Vec<usize>)> {
        (1usize..10)
            .prop_flat_map(|n| {
                let edges = (0..n)
                    .map(|i| proptest::sample::subsequence((0..i).collect::<Vec<_>>(), 0..=i))
                    .collect::<Vec<_>>();
                let registration = Just((0..n).collect::<Vec<_>>()).prop_shuffle();
                (edges, registration)
            })
    }

    proptest! {
        #[test]
        fn plan_respects_every_dependency((edges, registration) in dag()) {
            let specs = registration
                .iter()
                .map(|&i| passthrough(&format!("n{i}")).depends_on(edges[i].iter().map(|d| format!("n{d}"))))
                .collect();
            let plan = compose(&map(), specs).unwrap();
            let position: HashMap<&str, usize> = plan.order().enumerate().map(|(p, n)| (n, p)).collect();

            prop_assert_eq!(position.len(), edges.len());
            for (i, deps) in edges.iter().enumerate() {
                let me = position[format!("n{i}").as_str()];
                for d in deps {
                    let dep = position[format!("n{d}").as_str()];
                    prop_assert!(dep < me);
                }
            }
        }

        #[test]
        fn any_back_edge_is_a_cycle((edges, registration) in dag().prop_filter("needs an edge", |(e, _)| e.iter().any(|d| !d.is_empty()))) {
            let (from, to) = edges
                .iter()
                .enumerate()
                .find_map(|(i, deps)| deps.first().map(|&d| (i, d)))
                .unwrap();
            let specs = registration
                .iter()
                .map(|&i| {
                    let spec = passthrough(&format!("n{i}")).depends_on(edges[i].iter().map(|d| format!("n{d}")));
                    if i == to { spec.depends_on([format!("n{from}")]) } else { spec }
                })
                .collect();
            prop_assert!(matches!(compose(&map(), specs), Err(CompositionError::Cycle(_))));
        }
    }
}
