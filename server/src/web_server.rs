//! Axum HTTP server for the web client and the keep-alive daemon: /ping liveness,
//! authenticated /api/shutdown, port-forward API with an SSE snapshot stream
//! (/api/forwards/events), domain-tunnel API, and local-port introspection.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, KeepAliveStream, Sse},
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::WatchStream;
use tower_http::cors::CorsLayer;

use common::config::{Config, AUTH_COOKIE_NAME};
use common::forward::{ports, provider, AddForward, ForwardContext, ForwardRegistry, PortForward};
use common::tunnel::TunnelGroups;

use crate::domains::{DomainRecord, DomainRegistry};
use crate::sessions::LogSessions;

/// Shared app state: forward registry, tunnel groups, domain registry, auth token, and the
/// channel that triggers graceful shutdown.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ForwardRegistry>,
    pub groups: Arc<TunnelGroups>,
    pub domains: Arc<DomainRegistry>,
    pub sessions: Arc<LogSessions>,
    pub token: Option<String>,
    pub shutdown_tx: mpsc::Sender<()>,
}

/// POST /api/domains body.
#[derive(serde::Deserialize)]
struct RegisterDomainBody {
    domain: String,
    local_url: String,
}

/// POST /api/domains/tunnel/{start,stop} body.
#[derive(serde::Deserialize)]
struct DomainActionBody {
    domain: String,
}

/// POST /api/ports/kill body.
#[derive(serde::Deserialize)]
struct KillPortBody {
    pid: u32,
}

/// Build the shared state from config. Returns the shutdown receiver for `run_web_server`.
pub fn build_state(cfg: &Config) -> (AppState, mpsc::Receiver<()>) {
    let groups = Arc::new(TunnelGroups::new(cfg));
    let registry = ForwardRegistry::new(ForwardContext {
        cfg: cfg.clone(),
        groups: groups.clone(),
    });
    let domains = Arc::new(DomainRegistry::load(cfg, groups.clone()));
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let state = AppState {
        registry,
        groups,
        domains,
        sessions: LogSessions::new(),
        token: cfg.read_auth_token(),
        shutdown_tx,
    };
    (state, shutdown_rx)
}

/// Build the router. Kept separate from serving so tests drive it with tower.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .route("/api/forwards", get(list_forwards_handler).post(add_forward_handler))
        .route("/api/forwards/events", get(forward_events_handler))
        .route("/api/forwards/providers", get(providers_handler))
        .route("/api/forwards/{port}", delete(remove_forward_handler))
        .route("/api/forwards/{port}/logs", get(forward_logs_handler))
        .route("/api/domains", get(list_domains_handler).post(register_domain_handler))
        .route("/api/domains/tunnel/start", post(start_domain_handler))
        .route("/api/domains/tunnel/stop", post(stop_domain_handler))
        .route("/api/ports", get(list_ports_handler))
        .route("/api/ports/kill", post(kill_port_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the server on 127.0.0.1:port until /api/shutdown (or ctrl-c). `shutdown_rx` is the
/// receiving side of the state's shutdown channel.
pub async fn run_web_server(
    port: u16,
    state: AppState,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("server listening on http://127.0.0.1:{}", port);
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => tracing::info!("graceful shutdown requested"),
                _ = tokio::signal::ctrl_c() => tracing::info!("ctrl-c, shutting down"),
            }
        })
        .await?;
    Ok(())
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.token.as_deref() else {
        // No credentials configured; the server is loopback-only.
        return true;
    };
    let Some(cookies) = headers.get("cookie").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    cookies.split(';').any(|c| {
        let mut parts = c.trim().splitn(2, '=');
        parts.next() == Some(AUTH_COOKIE_NAME) && parts.next() == Some(expected)
    })
}

async fn ping_handler() -> &'static str {
    "pong"
}

/// POST /api/shutdown: authenticated graceful stop. A 200 response is the signal that the
/// server is stopping.
async fn shutdown_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if !authorized(&state, &headers) {
        return Err((StatusCode::UNAUTHORIZED, "missing or invalid token".into()));
    }
    tracing::info!("shutdown requested");
    state.groups.stop_health_checks();
    let _ = state.shutdown_tx.try_send(());
    Ok(Json(serde_json::json!({ "status": "shutting_down" })))
}

async fn list_forwards_handler(State(state): State<AppState>) -> Json<Vec<PortForward>> {
    Json(state.registry.list())
}

async fn add_forward_handler(
    State(state): State<AppState>,
    Json(body): Json<AddForward>,
) -> Result<Json<PortForward>, (StatusCode, String)> {
    state
        .registry
        .add(body)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("{:#}", e)))
}

async fn remove_forward_handler(
    State(state): State<AppState>,
    Path(port): Path<u16>,
) -> Result<Json<PortForward>, (StatusCode, String)> {
    state
        .registry
        .remove(port)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::NOT_FOUND, format!("{:#}", e)))
}

async fn forward_logs_handler(
    State(state): State<AppState>,
    Path(port): Path<u16>,
) -> Result<Json<Vec<String>>, (StatusCode, String)> {
    state
        .registry
        .logs(port)
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("no forward on port {}", port)))
}

/// GET /api/forwards/events: SSE stream of full-list snapshots. The first event is the
/// current snapshot; later events coalesce, so a slow client only ever sees the latest.
async fn forward_events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = WatchStream::new(state.registry.subscribe()).map(|snapshot| {
        Ok(Event::default()
            .event("forwards")
            .data(String::from_utf8_lossy(&snapshot).into_owned()))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn providers_handler(State(state): State<AppState>) -> Json<Vec<provider::ProviderInfo>> {
    Json(provider::list_providers(state.registry.context()).await)
}

async fn list_domains_handler(State(state): State<AppState>) -> Json<Vec<DomainRecord>> {
    Json(state.domains.list().await)
}

async fn register_domain_handler(
    State(state): State<AppState>,
    Json(body): Json<RegisterDomainBody>,
) -> Result<Json<DomainRecord>, (StatusCode, String)> {
    state
        .domains
        .register(&body.domain, &body.local_url)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("{:#}", e)))
}

/// Query params for the SSE domain-start stream: reattach to a running operation with
/// `?session_id=<id>&log_index=<k>` and receive the log suffix from index k.
#[derive(serde::Deserialize, Default)]
struct SessionQuery {
    session_id: Option<String>,
    log_index: Option<usize>,
}

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

fn session_events(
    session: &Arc<crate::sessions::LogSession>,
    from: usize,
    announce_id: bool,
) -> EventStream {
    let lines = session
        .stream_from(from)
        .map(|line| Ok(Event::default().data(line)));
    let done = stream::once(async { Ok(Event::default().event("done").data("done")) });
    if announce_id {
        let id = session.id.clone();
        Box::pin(
            stream::once(async move { Ok(Event::default().event("session").data(id)) })
                .chain(lines)
                .chain(done),
        )
    } else {
        Box::pin(lines.chain(done))
    }
}

/// POST /api/domains/tunnel/start: runs the start as a buffered log session streamed over
/// SSE. The first event carries the opaque session id; a disconnected client reattaches via
/// the query params and gets the suffix.
async fn start_domain_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    body: axum::body::Bytes,
) -> Result<Sse<KeepAliveStream<EventStream>>, (StatusCode, String)> {
    if let Some(session_id) = query.session_id.as_deref() {
        let session = state
            .sessions
            .get(session_id)
            .ok_or((StatusCode::NOT_FOUND, format!("unknown session {}", session_id)))?;
        let events = session_events(&session, query.log_index.unwrap_or(0), false);
        return Ok(Sse::new(events).keep_alive(KeepAlive::default()));
    }

    let Ok(body) = serde_json::from_slice::<DomainActionBody>(&body) else {
        return Err((StatusCode::BAD_REQUEST, "missing domain body".to_string()));
    };
    let session = state.sessions.create();
    let worker = session.clone();
    let domains = state.domains.clone();
    tokio::spawn(async move {
        worker.push(format!("starting tunnel for {}", body.domain));
        match domains.start(&body.domain).await {
            Ok(record) => worker.push(format!(
                "tunnel for {} is up at https://{}",
                record.domain, record.domain
            )),
            Err(e) => worker.push(format!("starting tunnel for {} failed: {:#}", body.domain, e)),
        }
        worker.finish();
    });

    let events = session_events(&session, 0, true);
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn stop_domain_handler(
    State(state): State<AppState>,
    Json(body): Json<DomainActionBody>,
) -> Result<Json<DomainRecord>, (StatusCode, String)> {
    state
        .domains
        .stop(&body.domain)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))
}

async fn list_ports_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<ports::ListeningPort>>, (StatusCode, String)> {
    ports::list_listening_ports(&state.registry.context().cfg)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, format!("{:#}", e)))
}

async fn kill_port_handler(
    State(state): State<AppState>,
    Json(body): Json<KillPortBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    ports::kill_pid(&state.registry.context().cfg, body.pid)
        .await
        .map(|_| Json(serde_json::json!({ "killed": body.pid })))
        .map_err(|e| (StatusCode::FORBIDDEN, format!("{:#}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn test_state(token: Option<&str>) -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::with_data_dir(dir.path().to_path_buf());
        let groups = Arc::new(TunnelGroups::new(&cfg));
        let registry = ForwardRegistry::new(ForwardContext {
            cfg: cfg.clone(),
            groups: groups.clone(),
        });
        let domains = Arc::new(DomainRegistry::load(&cfg, groups.clone()));
        let (shutdown_tx, _rx) = mpsc::channel(1);
        AppState {
            registry,
            groups,
            domains,
            sessions: LogSessions::new(),
            token: token.map(|t| t.to_string()),
            shutdown_tx,
        }
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let app = app(test_state(None));
        let resp = app
            .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"pong");
    }

    #[tokio::test]
    async fn shutdown_requires_token_cookie() {
        let app = app(test_state(Some("secret")));
        let resp = app
            .clone()
            .oneshot(Request::post("/api/shutdown").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(
                Request::post("/api/shutdown")
                    .header("cookie", format!("{}=secret", AUTH_COOKIE_NAME))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn forwards_list_starts_empty() {
        let app = app(test_state(None));
        let resp = app
            .oneshot(Request::get("/api/forwards").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"[]");
    }

    #[tokio::test]
    async fn unknown_forward_removal_is_404() {
        let app = app(test_state(None));
        let resp = app
            .oneshot(Request::delete("/api/forwards/9999").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
