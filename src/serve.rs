//! HTTP control surface: translate requests into supervisor operations.
use crate::config::ServerConfig;
use crate::status::{SessionInfo, StatusReport};
use crate::supervisor::{Credentials, RefreshOutcome, StartOutcome, Supervisor};
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
struct AppState {
    supervisor: Arc<Supervisor>,
}

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    let state = AppState { supervisor };

    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/refresh_timer", post(refresh_timer))
        .route("/api/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve the control API.
pub async fn run(
    config: &ServerConfig,
    supervisor: Arc<Supervisor>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(supervisor);

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("control API listening on {local_addr}");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.supervisor.status())
}

async fn start(State(state): State<AppState>, Form(credentials): Form<Credentials>) -> Response {
    match state.supervisor.start(credentials).await {
        StartOutcome::Started { .. } | StartOutcome::NotificationFailed => {
            Redirect::to("/").into_response()
        }
        StartOutcome::AlreadyRunning => "Worker already running".into_response(),
        StartOutcome::SpawnFailed(e) => {
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn stop(State(state): State<AppState>) -> Redirect {
    state.supervisor.stop().await;
    Redirect::to("/")
}

async fn refresh_timer(State(state): State<AppState>) -> Redirect {
    if state.supervisor.refresh_timer().await == RefreshOutcome::NotRunning {
        tracing::debug!("refresh ignored, no session");
    }
    Redirect::to("/")
}

async fn index(State(state): State<AppState>) -> Html<String> {
    let report = state.supervisor.status();
    let session = state.supervisor.session_info();
    Html(render_index(&report, session.as_ref()))
}

fn render_index(report: &StatusReport, session: Option<&SessionInfo>) -> String {
    let state = if report.is_running() { "RUNNING" } else { "STOPPED" };
    let started = session
        .map(|s| {
            format!(
                "<p>pid {} since {}</p>",
                s.pid,
                s.started_at.format("%Y-%m-%d %H:%M:%S UTC")
            )
        })
        .unwrap_or_default();

    format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>watchkeeper</title></head>
<body>
<h1>Worker: <span id="status">{state}</span></h1>
<p>Time remaining: <span id="remaining">{:02}:{:02}:{:02}</span></p>
{started}
<form method="post" action="/start">
  <input name="email" type="email" placeholder="email" required>
  <input name="password" type="password" placeholder="password" required>
  <input name="otp" placeholder="one-time code" required>
  <button type="submit">Start</button>
</form>
<form method="post" action="/refresh_timer"><button type="submit">Refresh timer</button></form>
<form method="post" action="/stop"><button type="submit">Stop</button></form>
</body>
</html>
"#,
        report.hours, report.minutes, report.seconds
    )
}
