//! Route handlers and the application router.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware as axum_mw;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::cases::CaseService;
use crate::error::CoreError;
use crate::events::{Event, EventBus};
use crate::ingest::IngestionPipeline;
use crate::middleware::request_logging;
use crate::models::{now_ts, CaseStatus, LabelRequest, TransactionRequest};
use crate::patterns::miner::run_mining_job;
use crate::risk::guardian::Guardian;
use crate::risk::registry::{ModelRegistry, MISSING_VERSION};
use crate::risk::scorer::{CurrentModel, BLOCK_THRESHOLD, REVIEW_THRESHOLD};
use crate::risk::trainer::retrain_from_labels;
use crate::storage::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub pipeline: Arc<IngestionPipeline>,
    pub cases: Arc<CaseService>,
    pub bus: EventBus,
    pub registry: Arc<ModelRegistry>,
    pub current: Arc<CurrentModel>,
    pub guardian: Arc<Guardian>,
    pub retrain_lock: Arc<tokio::sync::Mutex<()>>,
    pub guardian_enabled: bool,
    pub miner_window: chrono::Duration,
    pub cors_origins: Vec<String>,
}

pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::CaseClosed => StatusCode::BAD_REQUEST,
            CoreError::ScorerUnavailable(_) | CoreError::BusFull => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CoreError::Store(_) | CoreError::Artifact(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "detail": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
struct CasesQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

/// CORS policy from the configured origin list. An entry of "*" (or an
/// empty list) keeps the permissive default; anything else becomes an
/// exact-origin allow list.
fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.cors_origins);
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(readiness))
        .route("/transactions", post(create_transaction).get(list_transactions))
        .route("/transactions/:txn_id", get(get_transaction))
        .route("/cases", get(list_cases))
        .route("/cases/suggested", get(suggested_cases))
        .route("/cases/:case_id/label", post(label_case))
        .route("/cases/:case_id/explain", get(explain_case))
        .route("/patterns", get(list_patterns))
        .route("/metric-snapshots", get(list_metric_snapshots))
        .route("/metrics", get(get_metrics))
        .route("/retrain", post(retrain))
        .route("/mine-patterns", post(mine_patterns))
        .route("/guardian/status", get(guardian_status))
        .route("/guardian/decisions", get(guardian_decisions))
        .route("/stream/events", get(stream_events))
        .layer(cors)
        .layer(axum_mw::from_fn(request_logging))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "timestamp": now_ts() }))
}

async fn readiness(State(state): State<AppState>) -> Json<serde_json::Value> {
    let db_ok = state.store.ping();
    let model_version = state.registry.current_version();
    let model_ok = model_version != MISSING_VERSION;
    let all_ready = db_ok && model_ok;
    Json(json!({
        "status": if all_ready { "ready" } else { "degraded" },
        "timestamp": now_ts(),
        "checks": { "db": db_ok, "model": model_ok },
        "model_version": model_version,
    }))
}

async fn create_transaction(
    State(state): State<AppState>,
    Json(request): Json<TransactionRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let scored = state.pipeline.ingest(request).await?;
    Ok(Json(serde_json::to_value(&scored).map_err(CoreError::from)?))
}

async fn list_transactions(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let rows = state.store.list_transactions(query.limit.min(1000))?;
    Ok(Json(serde_json::to_value(rows).map_err(CoreError::from)?))
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(txn_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let txn = state
        .store
        .get_transaction(&txn_id)?
        .ok_or_else(|| CoreError::NotFound("transaction".to_string()))?;
    let risk = state.store.get_risk_fields(&txn_id)?;
    let case = state.store.get_case_for_txn(&txn_id)?;

    let mut detail = serde_json::to_value(&txn).map_err(CoreError::from)?;
    if let Some(obj) = detail.as_object_mut() {
        if let Some((score, features_json, reasons_json, model_version)) = risk {
            obj.insert("risk_score".to_string(), json!(score));
            obj.insert(
                "features".to_string(),
                serde_json::from_str(&features_json).unwrap_or(serde_json::Value::Null),
            );
            obj.insert(
                "reasons".to_string(),
                serde_json::from_str(&reasons_json).unwrap_or(serde_json::Value::Null),
            );
            obj.insert("model_version".to_string(), json!(model_version));
        }
        if let Some(case) = case {
            obj.insert("case_id".to_string(), json!(case.case_id));
            obj.insert("case_status".to_string(), json!(case.status.as_str()));
            obj.insert("priority".to_string(), json!(case.priority.as_str()));
        }
    }
    Ok(Json(detail))
}

async fn list_cases(
    State(state): State<AppState>,
    Query(query): Query<CasesQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(CaseStatus::parse(raw).ok_or_else(|| {
            CoreError::Validation(format!("unknown case status: {raw}"))
        })?),
        None => None,
    };
    let cases = state.cases.list(status, query.limit.min(1000))?;
    Ok(Json(serde_json::to_value(cases).map_err(CoreError::from)?))
}

async fn suggested_cases(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let cases = state.cases.suggested(query.limit.min(1000))?;
    Ok(Json(serde_json::to_value(cases).map_err(CoreError::from)?))
}

async fn label_case(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    Json(request): Json<LabelRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state.cases.label(&case_id, request).await?;
    Ok(Json(json!({
        "label_id": outcome.label_id,
        "case_id": outcome.case_id,
        "new_status": outcome.new_status.as_str(),
    })))
}

async fn explain_case(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(state.cases.get_explanation(&case_id).await?))
}

async fn list_patterns(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let cards = state.store.list_pattern_cards(query.limit.min(1000))?;
    let rows: Vec<serde_json::Value> = cards
        .iter()
        .map(|card| {
            json!({
                "pattern_id": card.pattern_id,
                "name": card.name,
                "description": card.description,
                "discovered_at": card.discovered_at,
                "status": card.status.as_str(),
                "pattern_type": card.pattern_type.as_str(),
                "confidence": card.confidence,
                "detection_rule": card.detection_rule,
                "stats": card.stats,
            })
        })
        .collect();
    Ok(Json(json!(rows)))
}

async fn list_metric_snapshots(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let snapshots = state.store.list_metric_snapshots(query.limit.min(1000))?;
    Ok(Json(
        serde_json::to_value(snapshots).map_err(CoreError::from)?,
    ))
}

async fn get_metrics(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let summary = state.store.metrics_summary()?;
    let mut value = serde_json::to_value(&summary).map_err(CoreError::from)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "model_version".to_string(),
            json!(state.registry.current_version()),
        );
        obj.insert(
            "thresholds".to_string(),
            json!({ "review": REVIEW_THRESHOLD, "block": BLOCK_THRESHOLD }),
        );
    }
    Ok(Json(value))
}

async fn retrain(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let outcome = {
        let _guard = state.retrain_lock.lock().await;
        retrain_from_labels(
            &state.store,
            &state.registry,
            &state.current,
            &state.bus,
            true,
        )?
    };
    Ok(Json(outcome.to_json()))
}

async fn mine_patterns(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let patterns = run_mining_job(
        &state.store,
        &state.bus,
        state.miner_window,
        chrono::Utc::now(),
    )?;
    Ok(Json(json!({
        "patterns_found": patterns.len(),
        "patterns": patterns
            .iter()
            .map(|p| json!({
                "name": p.name,
                "type": p.pattern_type.as_str(),
                "confidence": p.confidence,
            }))
            .collect::<Vec<_>>(),
    })))
}

async fn guardian_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "running": state.guardian.is_running(),
        "enabled": state.guardian_enabled,
        "check_interval": state.guardian.check_interval().as_secs(),
        "consecutive_failures": state.guardian.consecutive_failures(),
        "timestamp": now_ts(),
    }))
}

async fn guardian_decisions(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let decisions = state.store.list_agent_decisions(query.limit.min(100))?;
    Ok(Json(
        serde_json::to_value(decisions).map_err(CoreError::from)?,
    ))
}

/// Newline-framed SSE stream of bus events. Subscribers past the cap get a
/// 503; slow consumers lose events rather than backpressuring publishers.
async fn stream_events(
    State(state): State<AppState>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let subscription = state.bus.subscribe()?;

    let greeting = serde_json::to_string(&Event::connected()).unwrap_or_default();
    let connected = stream::once(async move { Ok(SseEvent::default().data(greeting)) });

    let events = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv_or_heartbeat().await?;
        let data = serde_json::to_string(&event).ok()?;
        Some((Ok::<_, Infallible>(SseEvent::default().data(data)), subscription))
    });

    Ok(Sse::new(connected.chain(events)))
}
