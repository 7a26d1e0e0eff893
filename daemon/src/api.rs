//! Management HTTP API exposed on the daemon's own port: status, restart signals, binary
//! upload/validation, SSE log tailing, and the SSE-streamed daemon self-replacement that
//! ends in an exec of the newest daemon image.

use std::convert::Infallible;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::Stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use common::config::Config;
use common::process;

use crate::binary;
use crate::client::ServerClient;
use crate::state::DaemonState;

/// How long the restart-daemon flow waits for the supervisor to stop the child
/// (graceful-stop bound plus slack).
const STOP_WAIT: Duration = Duration::from_secs(65);

/// Lines of history the log tail starts with.
const LOG_TAIL_LINES: u32 = 100;

pub struct DaemonContext {
    pub cfg: Config,
    pub state: Arc<DaemonState>,
    pub client: ServerClient,
    /// Original argv (without argv0), replayed on exec.
    pub args: Vec<String>,
}

pub fn app(ctx: Arc<DaemonContext>) -> Router {
    Router::new()
        .route("/api/keep-alive/status", get(status_handler))
        .route("/api/keep-alive/restart", post(restart_handler))
        .route("/api/keep-alive/restart-daemon", post(restart_daemon_handler))
        .route("/api/keep-alive/upload-target", post(upload_target_handler))
        .route("/api/keep-alive/set-binary", post(set_binary_handler))
        .route("/api/keep-alive/logs", get(logs_handler))
        .route("/api/keep-alive/fix-tunnel", post(fix_tunnel_handler))
        .with_state(ctx)
}

async fn status_handler(State(ctx): State<Arc<DaemonContext>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(ctx.state.status()).unwrap_or_default())
}

/// POST restart: non-blocking signal to the health loop; reports when one is already queued.
async fn restart_handler(State(ctx): State<Arc<DaemonContext>>) -> Json<serde_json::Value> {
    let requested = ctx.state.request_restart();
    Json(serde_json::json!({
        "requested": requested,
        "already_pending": !requested,
    }))
}

/// POST upload-target: where the client should PUT a freshly built server binary — the next
/// `-vN` name next to the current one.
async fn upload_target_handler(
    State(ctx): State<Arc<DaemonContext>>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let current = ctx.state.current_binary();
    let dir = current
        .parent()
        .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "binary has no parent".to_string()))?;
    let name = current
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "binary has no name".to_string()))?;
    let parsed = binary::parse_binary_version(name);
    let next_name = format!("{}-v{}", parsed.base, parsed.version + 1);
    Ok(Json(serde_json::json!({
        "path": dir.join(&next_name),
        "name": next_name,
    })))
}

#[derive(serde::Deserialize)]
struct SetBinaryBody {
    path: PathBuf,
}

/// POST set-binary: validate a newly arrived binary (non-empty, executable). The upgrade
/// tick picks it up within one interval.
async fn set_binary_handler(
    State(ctx): State<Arc<DaemonContext>>,
    Json(body): Json<SetBinaryBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let meta = std::fs::metadata(&body.path)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("stat {}: {}", body.path.display(), e)))?;
    if !meta.is_file() || meta.len() == 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("{} is empty or not a file", body.path.display()),
        ));
    }
    binary::make_executable(&body.path)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))?;
    ctx.state.set_next_binary(Some(body.path.clone()));
    Ok(Json(serde_json::json!({ "ok": true, "path": body.path })))
}

async fn fix_tunnel_handler(
    State(ctx): State<Arc<DaemonContext>>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    ctx.client
        .fix_tunnels()
        .await
        .map(|log| Json(serde_json::json!({ "log": log })))
        .map_err(|e| (StatusCode::BAD_GATEWAY, format!("{:#}", e)))
}

/// GET logs: SSE stream of `tail -f` over the server log. The tail child is killed when the
/// client disconnects (the stream drop ends the pump, kill_on_drop reaps the child).
async fn logs_handler(
    State(ctx): State<Arc<DaemonContext>>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let log_path = ctx.cfg.server_log_path();
    let mut cmd = process::command(&ctx.cfg, "tail");
    cmd.arg("-n")
        .arg(LOG_TAIL_LINES.to_string())
        .arg("-f")
        .arg(&log_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("spawning tail: {}", e)))?;
    let stdout = child
        .stdout
        .take()
        .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "tail stdout not captured".to_string()))?;

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(Ok(Event::default().data(line))).await.is_err() {
                break; // client gone; dropping `child` kills the tail
            }
        }
        drop(child);
    });
    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

/// POST restart-daemon: stream progress over SSE while stopping the child, resolving the
/// newest daemon binary, and finally exec-replacing this process. A successful exec never
/// returns; failure writes a log line only.
async fn restart_daemon_handler(
    State(ctx): State<Arc<DaemonContext>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(16);
    tokio::spawn(async move {
        let log = |msg: String| {
            let tx = tx.clone();
            async move {
                tracing::info!("{}", msg);
                let _ = tx.send(Ok(Event::default().data(msg))).await;
            }
        };

        if ctx.state.request_daemon_restart() {
            log("daemon restart requested, stopping server".to_string()).await;
        } else {
            log("daemon restart already pending".to_string()).await;
        }

        let deadline = tokio::time::Instant::now() + STOP_WAIT;
        while ctx.state.is_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        if ctx.state.is_running() {
            log("server did not stop in time, continuing anyway".to_string()).await;
        } else {
            log("server stopped".to_string()).await;
        }

        let target = match binary::find_newer_binary(&ctx.state.daemon_binary) {
            Ok(Some(newer)) => {
                log(format!("upgrading daemon to {}", newer.display())).await;
                newer
            }
            Ok(None) => ctx.state.daemon_binary.clone(),
            Err(e) => {
                log(format!("binary discovery failed ({:#}), re-executing current", e)).await;
                ctx.state.daemon_binary.clone()
            }
        };
        if let Err(e) = binary::make_executable(&target) {
            log(format!("marking {} executable: {:#}", target.display(), e)).await;
        }

        log(format!("exec {}", target.display())).await;
        let _ = tx.send(Ok(Event::default().event("done").data("done"))).await;
        // Give the SSE writer a moment to flush before the image is replaced.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let err = exec_replace(&target, &ctx.args);
        tracing::error!("exec {} failed: {}", target.display(), err);
    });
    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

#[cfg(unix)]
fn exec_replace(target: &std::path::Path, args: &[String]) -> std::io::Error {
    use std::os::unix::process::CommandExt;
    std::process::Command::new(target).args(args).exec()
}

#[cfg(not(unix))]
fn exec_replace(_target: &std::path::Path, _args: &[String]) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Unsupported, "exec is unix-only")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DaemonState;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn test_ctx(dir: &std::path::Path) -> Arc<DaemonContext> {
        let cfg = Config::with_data_dir(dir.to_path_buf());
        let (state, _signals) = DaemonState::new(
            dir.join("ai-critic-server"),
            dir.join("ai-critic-daemon"),
            23712,
        );
        let client = ServerClient::new(&cfg, 23712);
        Arc::new(DaemonContext {
            cfg,
            state,
            client,
            args: Vec::new(),
        })
    }

    #[tokio::test]
    async fn status_reports_ports_and_binary() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_ctx(dir.path()));
        let resp = app
            .oneshot(Request::get("/api/keep-alive/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["server_port"], 23712);
        assert_eq!(json["running"], false);
    }

    #[tokio::test]
    async fn second_restart_request_reports_pending() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let app = app(ctx);
        let first = app
            .clone()
            .oneshot(Request::post("/api/keep-alive/restart").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body: serde_json::Value =
            serde_json::from_slice(&first.into_body().collect().await.unwrap().to_bytes()).unwrap();
        assert_eq!(body["requested"], true);

        let second = app
            .oneshot(Request::post("/api/keep-alive/restart").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body: serde_json::Value =
            serde_json::from_slice(&second.into_body().collect().await.unwrap().to_bytes()).unwrap();
        assert_eq!(body["already_pending"], true);
    }

    #[tokio::test]
    async fn upload_target_is_next_version() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_ctx(dir.path()));
        let resp = app
            .oneshot(
                Request::post("/api/keep-alive/upload-target")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body: serde_json::Value =
            serde_json::from_slice(&resp.into_body().collect().await.unwrap().to_bytes()).unwrap();
        assert_eq!(body["name"], "ai-critic-server-v1");
    }

    #[tokio::test]
    async fn set_binary_rejects_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("ai-critic-server-v2");
        std::fs::write(&empty, b"").unwrap();
        let app = app(test_ctx(dir.path()));
        let resp = app
            .oneshot(
                Request::post("/api/keep-alive/set-binary")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({ "path": empty }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
