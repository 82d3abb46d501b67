//! Minimal conduit example: authorization slots, a tracing wrap, and a
//! cached, batched user lookup behind one endpoint.
//!
//! Run with:
//!   RUST_LOG=conduit=debug,basic=info cargo run --example basic
//!
//! There is no socket here. Envelopes are built by hand the way a transport
//! adapter would build them.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::time::Duration;

use conduit::middleware::{MiddlewareSpec, auth, trace::Trace};
use conduit::{Loader, Request, RequestEnvelope, RequestError, Response, RouteConfig, Router, Settings, Store};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SETTINGS: &str = r#"
[cache]
capacity = 100
time_to_live = "5m"

[batch]
max_batch_size = 10
"#;

#[derive(Clone, Debug, Serialize)]
struct User {
    id: String,
    name: String,
}

/// In-memory stand-in for a database table.
struct UserTable(HashMap<String, String>);

impl Store for UserTable {
    type Key = String;
    type Entity = User;
    type Error = Infallible;

    fn key_of(&self, user: &User) -> String {
        user.id.clone()
    }

    async fn fetch(&self, keys: HashSet<String>) -> Result<Vec<User>, Infallible> {
        info!(keys = keys.len(), "SELECT … WHERE id IN (…)");
        Ok(keys
            .into_iter()
            .filter_map(|id| self.0.get(&id).map(|name| User { name: name.clone(), id }))
            .collect())
    }
}

#[tokio::main]
async fn main() -> Result<(), conduit::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_toml_str(SETTINGS)?;
    let table = UserTable(HashMap::from([
        ("u1".to_owned(), "alice".to_owned()),
        ("u2".to_owned(), "bob".to_owned()),
    ]));
    let users = Loader::new("user_by_id", table, &settings);

    let shutdown = CancellationToken::new();
    let sweeper = users.cache().spawn_sweeper(Duration::from_secs(60), shutdown.clone());

    let mut specs = auth::specs();
    specs.push(MiddlewareSpec::wrap("Trace", Trace).depends_on(["AllowAnonymous"]));

    let app = Router::new(auth::context_map()?, specs)?
        .on("/users/{id}", RouteConfig::new().set("requireRoles", vec!["admin", "support"]), {
            let users = users.clone();
            move |req: Request| get_user(users.clone(), req)
        })?
        .on("/healthz", RouteConfig::new().set("allowAnonymous", true), healthz)?;
    info!(order = ?app.plan().order().collect::<Vec<_>>(), "router ready");

    let admin = r#"{"sub":"ops","roles":["admin"]}"#;
    let requests = [
        RequestEnvelope::new("/healthz"),
        RequestEnvelope::new("/users/u1"),
        RequestEnvelope::new("/users/u1").header(auth::USER_HEADER, r#"{"sub":"u2","roles":["user"]}"#),
        RequestEnvelope::new("/users/u1").header(auth::USER_HEADER, admin),
        RequestEnvelope::new("/users/u2").header(auth::USER_HEADER, admin),
        RequestEnvelope::new("/users/u9").header(auth::USER_HEADER, admin),
        RequestEnvelope::new("/nowhere"),
    ];

    // All at once: lookups that reach the resolver in the same window share
    // one store call.
    let responses = futures::future::join_all(requests.into_iter().map(|envelope| {
        let name = envelope.name().to_owned();
        let app = &app;
        async move { (name, app.handle(envelope).await.unwrap_or_else(RequestError::into_response)) }
    }))
    .await;
    for (name, response) in responses {
        info!(
            %name,
            status = response.status_code().as_u16(),
            body = %String::from_utf8_lossy(response.body()),
            "response"
        );
    }

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "cache sweeper did not stop cleanly");
    }
    Ok(())
}

async fn get_user(users: Loader<UserTable>, req: Request) -> Result<Response, RequestError> {
    let id = req.param("id").unwrap_or_default().to_owned();
    let user = users.get(id).await?;
    let body = serde_json::to_vec(&user).map_err(|e| RequestError::Defect(e.to_string()))?;
    Ok(Response::json(body))
}

async fn healthz(_req: Request) -> Result<&'static str, RequestError> {
    Ok("ok")
}
