//! Per-request tracing.

use std::time::{Duration, Instant};

use tracing::{Instrument, info, info_span};

use crate::handler::Outcome;
use crate::middleware::{Next, Wrap};
use crate::request::Request;

/// Wrap middleware that runs the rest of the chain inside a span and logs
/// the outcome with its latency.
///
/// The span carries the subject of the [`Identity`](super::auth::Identity)
/// when `allowAnonymous` provided one, so register it after that slot.
#[derive(Clone, Copy, Debug, Default)]
pub struct Trace;

impl Wrap for Trace {
    async fn call(&self, req: Request, next: Next) -> Outcome {
        let subject = req
            .get(&super::auth::ALLOW_ANONYMOUS)
            .map(|identity| identity.sub.clone())
            .unwrap_or_default();
        let span = info_span!("call", name = %req.name(), subject = %subject);
        let started = Instant::now();

        let outcome = next.run(req).instrument(span.clone()).await;

        let latency_us = micros(started.elapsed());
        span.in_scope(|| match &outcome {
            Ok(response) => info!(status = response.status_code().as_u16(), latency_us, "completed"),
            Err(error) => info!(status = error.status().as_u16(), kind = error.kind(), latency_us, "failed"),
        });
        outcome
    }
}

/// Saturates instead of truncating for durations past `u64::MAX` micros.
fn micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}
