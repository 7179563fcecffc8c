//! Hive Web 入口
//!
//! 启动: cargo run --bin hive-web --features web
//! 浏览器访问 http://127.0.0.1:8080

#![cfg(feature = "web")]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use hive::config::{load_config, AppConfig};
use hive::core::{ErrorKind, Hive, HiveBuilder, SessionCleanup, ShutdownCoordinator, ShutdownManager};
use hive::observability;
use hive::react::RunOptions;
use hive::registry::Capability;
use hive::trace::Trace;

struct AppState {
    hive: Hive,
    shutdown: Arc<ShutdownManager>,
}

#[derive(Debug, Deserialize)]
struct AskRequest {
    query: String,
    #[serde(default)]
    user_id: Option<String>,
    /// 覆盖默认截止时间（秒）
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct AskResponse {
    answer: String,
    trace: Trace,
}

#[derive(Debug, Serialize)]
struct AskError {
    error: ErrorKind,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace: Option<Trace>,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::DecisionProtocol | ErrorKind::Llm => StatusCode::BAD_GATEWAY,
        ErrorKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::LoopBoundExceeded => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (cfg, config_err) = match load_config(None) {
        Ok(cfg) => (cfg, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };
    observability::init_from_config(&cfg.log);
    if let Some(e) = config_err {
        tracing::warn!("Invalid configuration, using defaults: {}", e);
    }

    let addr = format!("{}:{}", cfg.web.host, cfg.web.port);
    let hive = HiveBuilder::new(cfg)
        .build()
        .await
        .context("Failed to start hive")?;

    let shutdown = Arc::new(ShutdownManager::new());
    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown));
    coordinator.register(SessionCleanup::new(Arc::clone(&hive.sessions)));
    shutdown.install_signal_handlers();

    let state = Arc::new(AppState {
        hive,
        shutdown: Arc::clone(&shutdown),
    });

    let app = Router::new()
        .route("/", get(index))
        .route("/ask", post(api_ask))
        .route("/capabilities", get(api_capabilities))
        .route("/capabilities/refresh", post(api_refresh))
        .route("/health", get(|| async { "OK" }))
        .with_state(Arc::clone(&state));

    tracing::info!("Hive Web: http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let signal = Arc::clone(&shutdown);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.wait_for_shutdown().await })
        .await?;

    coordinator.run_cleanup().await;
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../../static/index.html"))
}

async fn api_ask(State(state): State<Arc<AppState>>, Json(req): Json<AskRequest>) -> Response {
    let query = req.query.trim();
    if query.is_empty() {
        return (StatusCode::BAD_REQUEST, "query is required").into_response();
    }
    let user_id = req
        .user_id
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "anonymous".to_string());

    let mut options = RunOptions::default().with_cancel(state.shutdown.token().child_token());
    if let Some(secs) = req.timeout_secs {
        options = options.with_deadline(Duration::from_secs(secs));
    }

    match state
        .hive
        .orchestrator
        .run_query_detached(query, &user_id, options)
        .await
    {
        Ok(outcome) => Json(AskResponse {
            answer: outcome.answer,
            trace: outcome.trace,
        })
        .into_response(),
        Err(failure) => (
            status_for(failure.kind),
            Json(AskError {
                error: failure.kind,
                message: failure.message,
                trace: Some(failure.trace),
            }),
        )
            .into_response(),
    }
}

async fn api_capabilities(State(state): State<Arc<AppState>>) -> Json<Vec<Capability>> {
    Json(state.hive.registry.snapshot().await.list_all().to_vec())
}

async fn api_refresh(State(state): State<Arc<AppState>>) -> Json<Vec<Capability>> {
    Json(state.hive.refresh_registry().await.list_all().to_vec())
}
