use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::dedup::cookie_name;
use crate::error::GateError;
use crate::events::InboundEvent;
use crate::fingerprint::RequestHeaders;
use crate::gate::{EventGate, GateStores, SubmitRequest};
use crate::rate_limit::{ADMIN_BUCKET, READ_BUCKET};
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::CookieJar;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{info, warn};

const MAX_BODY_BYTES: usize = 64 * 1024;
const ACTOR_HEADER: &str = "x-actor-id";

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<EventGate>,
}

impl AppState {
    pub fn new(settings: &Settings, clock: Arc<dyn Clock>) -> Self {
        let stores = GateStores::in_memory(settings);
        Self {
            gate: Arc::new(EventGate::new(settings, stores, clock)),
        }
    }
}

pub async fn run_server(settings: Settings) -> Result<()> {
    let state = AppState::new(&settings, Arc::new(SystemClock));
    info!(
        recent_days = settings.metrics_window_recent_days,
        dedup_window_min = settings.view_dedup_window_min,
        "Event gate ready"
    );

    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/events", post(handle_event))
        .route("/subjects/:subject_id/trending", get(trending))
        .route("/subjects/:subject_id/metrics", get(subject_metrics))
        .route("/health", get(health))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

fn actor_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

async fn handle_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    body: Bytes,
) -> Result<Response, GateError> {
    let content_type_ok = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        == Some(true);
    if !content_type_ok {
        warn!(
            "Rejecting event: unsupported content-type {:?}",
            headers.get(header::CONTENT_TYPE)
        );
        return Ok(StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response());
    }

    let event: InboundEvent = serde_json::from_slice(&body)
        .map_err(|e| GateError::validation(format!("invalid JSON body: {e}")))?;

    let view_marker = event
        .subject_id
        .as_deref()
        .map(|s| cookie_name(s.trim()))
        .and_then(|name| jar.get(&name).map(|c| c.value().to_string()));
    let subject_id = event.subject_id.clone().unwrap_or_default();

    let outcome = state
        .gate
        .submit(SubmitRequest {
            event,
            headers: RequestHeaders::from(&headers),
            actor_id: actor_from(&headers),
            view_marker,
        })
        .await?;

    // Counted, duplicate and suppressed all look the same to the client.
    let body = Json(json!({
        "accepted": true,
        "idempotencyKey": outcome.idempotency_key,
    }));
    let jar = if outcome.set_view_marker {
        jar.add(state.gate.dedup().marker_cookie(subject_id.trim()))
    } else {
        jar
    };
    Ok((StatusCode::ACCEPTED, jar, body).into_response())
}

async fn trending(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(subject_id): Path<String>,
) -> Result<Json<serde_json::Value>, GateError> {
    let requester = state
        .gate
        .requester_identity(actor_from(&headers), &RequestHeaders::from(&headers))?;
    state.gate.limiter().check(READ_BUCKET, &requester).await?;

    let score = state.gate.trending_score(&subject_id).await?;
    Ok(Json(json!({
        "subjectId": subject_id,
        "score": score,
        "windowDays": state.gate.recent_window_days(),
    })))
}

async fn subject_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(subject_id): Path<String>,
) -> Result<Json<serde_json::Value>, GateError> {
    let requester = state
        .gate
        .requester_identity(actor_from(&headers), &RequestHeaders::from(&headers))?;
    state.gate.limiter().check(ADMIN_BUCKET, &requester).await?;

    let metrics = state.gate.subject_metrics(&subject_id).await?;
    Ok(Json(json!({
        "subjectId": subject_id,
        "recent": metrics.recent,
        "long": metrics.long,
    })))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        }
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        }
    }
}
