use crate::errors::Error;
use crate::gateway::CommandGateway;
use crate::live::LiveFeed;
use crate::metrics::gather_metrics;
use crate::model::ListResponse;
use crate::mqtt::{probe, MqttSettings};
use crate::query::{
    parse_limit, CommandParams, QueryService, SearchParams, StatsParams, TelemetryParams,
};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const LIVE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub queries: QueryService,
    pub gateway: CommandGateway,
    pub live: LiveFeed,
    pub api_token: Option<Arc<str>>,
    pub broker: Arc<MqttSettings>,
}

impl AppState {
    pub fn new(
        queries: QueryService,
        gateway: CommandGateway,
        live: LiveFeed,
        api_token: Option<String>,
        broker: MqttSettings,
    ) -> Self {
        Self {
            queries,
            gateway,
            live,
            api_token: api_token.map(Arc::from),
            broker: Arc::new(broker),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/control", post(send_command).get(list_commands))
        .route("/api/control/status/:device", get(command_status))
        .route("/api/device-states", get(device_states))
        .route("/api/telemetry", get(list_telemetry))
        .route("/api/telemetry/latest", get(latest_telemetry))
        .route("/api/telemetry/stats", get(telemetry_stats))
        .route("/api/telemetry/search", get(search_telemetry))
        .route("/api/config/rain-threshold", post(set_rain_threshold))
        .route("/api/live", get(live_events))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/api/health", get(health))
        .route("/api/mqtt/health", get(mqtt_health))
        .route("/api/db/health", get(db_health))
        .route("/metrics", get(metrics_handler))
        .merge(protected)
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

/// JSON error body with the status the error class maps to.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "Unauthorized".to_string(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) | Error::Malformed { .. } | Error::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::TransportUnavailable(_) | Error::Mqtt(_) | Error::StoreUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("API error: {}", self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct TokenParam {
    token: Option<String>,
}

/// Every token the request carries: `x-api-token`, `?token=`, and an
/// `Authorization: Bearer` credential (scheme matched case-insensitively).
fn presented_tokens(request: &Request) -> Vec<String> {
    let headers = request.headers();
    let mut tokens = Vec::new();

    if let Some(token) = headers.get("x-api-token").and_then(|v| v.to_str().ok()) {
        tokens.push(token.trim().to_string());
    }
    if let Ok(Query(TokenParam { token: Some(token) })) =
        Query::<TokenParam>::try_from_uri(request.uri())
    {
        tokens.push(token);
    }
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_credential)
    {
        tokens.push(token.to_string());
    }
    tokens
}

fn bearer_credential(value: &str) -> Option<&str> {
    let (scheme, credential) = value.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then_some(credential.trim())
}

async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.api_token.as_deref() else {
        return Ok(next.run(request).await);
    };

    if presented_tokens(&request).iter().any(|token| token == expected) {
        Ok(next.run(request).await)
    } else {
        warn!("Rejected unauthenticated request to {}", request.uri().path());
        Err(ApiError::unauthorized())
    }
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    info!(
        method = %method,
        uri = %uri,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Request completed"
    );
    response
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "time": Utc::now() }))
}

async fn mqtt_health(State(state): State<AppState>) -> Response {
    let url = state.broker.url();
    match probe(&state.broker, HEALTH_TIMEOUT).await {
        Ok(()) => Json(json!({ "connected": true, "url": url })).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "connected": false, "url": url, "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn db_health(State(state): State<AppState>) -> Response {
    let outcome = match tokio::time::timeout(HEALTH_TIMEOUT, state.queries.ping()).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(format!("no answer within {:?}", HEALTH_TIMEOUT)),
    };

    match outcome {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "error": e })),
        )
            .into_response(),
    }
}

async fn metrics_handler() -> String {
    gather_metrics()
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    device: Option<String>,
    status: Option<String>,
}

async fn send_command(
    State(state): State<AppState>,
    body: Result<Json<ControlRequest>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Json(body) = body?;
    let receipt = state
        .gateway
        .issue(body.device.as_deref(), body.status.as_deref())
        .await?;

    Ok(Json(json!({
        "success": true,
        "device": receipt.device,
        "slug": receipt.slug,
        "topic": receipt.topic,
        "status": receipt.status,
    })))
}

async fn list_commands(
    State(state): State<AppState>,
    Query(params): Query<CommandParams>,
) -> ApiResult<impl IntoResponse> {
    let limit = parse_limit(params.limit.as_deref())?;
    let data = state.queries.list_commands(&params).await?;
    Ok(Json(ListResponse {
        total: data.len(),
        data,
        limit,
    }))
}

async fn command_status(
    State(state): State<AppState>,
    Path(device): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let record = state
        .queries
        .latest_command(&device)
        .await?
        .ok_or_else(|| Error::NotFound(format!("no state recorded for {}", device)))?;
    Ok(Json(record))
}

async fn device_states(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.queries.device_states().await?))
}

async fn list_telemetry(
    State(state): State<AppState>,
    Query(params): Query<TelemetryParams>,
) -> ApiResult<impl IntoResponse> {
    let limit = parse_limit(params.limit.as_deref())?;
    let data = state.queries.list_telemetry(&params).await?;
    Ok(Json(ListResponse {
        total: data.len(),
        data,
        limit,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestParams {
    device_id: Option<String>,
}

async fn latest_telemetry(
    State(state): State<AppState>,
    Query(params): Query<LatestParams>,
) -> ApiResult<impl IntoResponse> {
    let reading = state
        .queries
        .latest_telemetry(params.device_id.as_deref())
        .await?
        .ok_or_else(|| Error::NotFound("no telemetry for this device".to_string()))?;
    Ok(Json(reading))
}

async fn telemetry_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.queries.telemetry_stats(&params).await?))
}

async fn search_telemetry(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<impl IntoResponse> {
    let limit = parse_limit(params.limit.as_deref())?;
    let data = state.queries.search_telemetry(&params).await?;
    Ok(Json(ListResponse {
        total: data.len(),
        data,
        limit,
    }))
}

#[derive(Debug, Deserialize)]
struct ThresholdRequest {
    threshold: Option<f64>,
}

async fn set_rain_threshold(
    State(state): State<AppState>,
    body: Result<Json<ThresholdRequest>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Json(body) = body?;
    let threshold = body
        .threshold
        .ok_or_else(|| Error::Validation("threshold is required".to_string()))?;
    state.gateway.set_rain_threshold(threshold).await?;
    Ok(Json(json!({ "success": true, "threshold": threshold })))
}

async fn live_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.live.subscribe();
    info!("Live session opened ({} active)", state.live.session_count());

    // The subscription lives inside the stream; axum drops the stream when
    // the client goes away, which unregisters the session.
    let events = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        Some((event.to_sse(), subscription))
    });

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(LIVE_KEEP_ALIVE)
            .text("keep-alive"),
    )
}
