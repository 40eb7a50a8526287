//! HTTP front-end: `POST /pub` ingest and the `/api/0` query endpoints.
//!
//! Provides [`serve`], which opens the recorder, optionally starts the MQTT
//! subscriber, and runs the axum server until ctrl-c.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::RecorderConfig;
use crate::ingest::{InboundMessage, IngestOutcome, Recorder};
use crate::storage::output::{parse_fields, write_locations, LocationQuery, OutputFormat};
use crate::storage::query::make_window;
use crate::transport::mqtt;

/// Topic prefix of messages received over HTTP.
pub const HTTP_BASE_TOPIC: &str = "owntracks";

/// JSON error body with a status code.
#[derive(Debug)]
struct ApiError(StatusCode, String);

impl ApiError {
    fn bad_request(msg: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, msg.into())
    }

    fn internal(msg: impl std::fmt::Display) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, msg.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the HTTP router around a shared recorder.
pub fn router(recorder: Arc<Recorder>) -> Router {
    Router::new()
        .route("/pub", post(publish))
        .route("/api/0/list", get(list))
        .route("/api/0/locations", get(locations))
        .route("/api/0/last", get(last))
        .route("/api/0/version", get(version))
        .with_state(recorder)
}

/// Open the store, start the MQTT subscriber if enabled, and serve HTTP
/// until ctrl-c.
pub async fn serve(config: RecorderConfig) -> Result<()> {
    let recorder = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || Recorder::open(&config))
            .await
            .context("recorder setup task failed")??
    };
    let recorder = Arc::new(recorder);

    let subscriber = if config.mqtt.enabled {
        let (mqtt_config, recorder) = (config.mqtt.clone(), Arc::clone(&recorder));
        Some(tokio::spawn(async move {
            if let Err(e) = mqtt::run_subscriber(mqtt_config, recorder).await {
                tracing::error!(error = %e, "MQTT subscriber stopped");
            }
        }))
    } else {
        tracing::info!("MQTT disabled");
        None
    };

    if config.server.http_port == 0 {
        tracing::info!("HTTP disabled, waiting for ctrl-c");
        let _ = tokio::signal::ctrl_c().await;
    } else {
        let bind_addr = format!("{}:{}", config.server.http_host, config.server.http_port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("cannot bind {bind_addr}"))?;
        tracing::info!(addr = %bind_addr, "listening at http://{bind_addr}/");

        axum::serve(listener, router(Arc::clone(&recorder)))
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "cannot listen for ctrl-c");
                }
                tracing::info!("shutting down HTTP server");
            })
            .await?;
    }

    if let Some(task) = subscriber {
        task.abort();
        let _ = task.await;
    }
    // The geocoder's blocking HTTP client must not be dropped on a runtime thread.
    tokio::task::spawn_blocking(move || drop(recorder)).await.ok();
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct PubParams {
    u: Option<String>,
    d: Option<String>,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Accept one tracker payload. User and device come from the `X-Limit-U` and
/// `X-Limit-D` headers, falling back to the `u` and `d` query parameters.
async fn publish(
    State(recorder): State<Arc<Recorder>>,
    headers: HeaderMap,
    Query(params): Query<PubParams>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let user = header_value(&headers, "x-limit-u").or(params.u);
    let device = header_value(&headers, "x-limit-d").or(params.d);
    let (Some(user), Some(device)) = (user, device) else {
        return Err(ApiError::bad_request("user and device are required"));
    };
    if user.contains('/') || device.contains('/') {
        return Err(ApiError::bad_request("user and device must not contain '/'"));
    }

    let msg = InboundMessage::new(format!("{HTTP_BASE_TOPIC}/{user}/{device}"), body.to_vec());
    let outcome = tokio::task::spawn_blocking(move || recorder.handle(&msg))
        .await
        .map_err(ApiError::internal)?;

    match outcome {
        IngestOutcome::Failed(e) => Err(ApiError::internal(e)),
        outcome => {
            tracing::debug!(%user, %device, ?outcome, "HTTP publish");
            Ok(Json(json!([])))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    user: Option<String>,
}

/// Users, or the devices of `?user=`.
async fn list(State(recorder): State<Arc<Recorder>>, Query(params): Query<ListParams>) -> ApiResult<Json<Value>> {
    let results = match params.user.as_deref() {
        Some(user) => recorder.log().list_devices(user),
        None => recorder.log().list_users(),
    }
    .map_err(ApiError::internal)?;
    Ok(Json(json!({ "results": results })))
}

#[derive(Debug, Default, Deserialize)]
struct LocationParams {
    user: Option<String>,
    device: Option<String>,
    from: Option<String>,
    to: Option<String>,
    limit: Option<usize>,
    format: Option<String>,
    fields: Option<String>,
}

fn location_query(params: LocationParams, now: i64) -> ApiResult<LocationQuery> {
    let (Some(user), Some(device)) = (params.user, params.device) else {
        return Err(ApiError::bad_request("user and device are required"));
    };
    if user.contains('/') || device.contains('/') {
        return Err(ApiError::bad_request("user and device must not contain '/'"));
    }
    let window = make_window(params.from.as_deref(), params.to.as_deref(), now)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let format = match params.format.as_deref() {
        Some(f) => f.parse::<OutputFormat>().map_err(ApiError::bad_request)?,
        None => OutputFormat::default(),
    };
    Ok(LocationQuery {
        user,
        device,
        window,
        limit: params.limit,
        format,
        fields: params.fields.as_deref().map(parse_fields),
    })
}

async fn locations(
    State(recorder): State<Arc<Recorder>>,
    Query(params): Query<LocationParams>,
) -> ApiResult<Response> {
    let query = location_query(params, chrono::Utc::now().timestamp())?;
    let content_type = query.format.content_type();

    let body = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let n = write_locations(&recorder.scanner(), &query, &mut out)?;
        tracing::debug!(user = %query.user, device = %query.device, n, format = %query.format, "locations query");
        Ok(out)
    })
    .await
    .map_err(ApiError::internal)?
    .map_err(ApiError::internal)?;

    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct LastParams {
    user: Option<String>,
    device: Option<String>,
    fields: Option<String>,
}

/// Latest snapshot of every matching device.
async fn last(State(recorder): State<Arc<Recorder>>, Query(params): Query<LastParams>) -> ApiResult<Json<Value>> {
    let fields = params.fields.as_deref().map(parse_fields);
    let snapshots = tokio::task::spawn_blocking(move || {
        recorder.snapshots().last(
            Some(recorder.cache()),
            params.user.as_deref(),
            params.device.as_deref(),
            fields.as_deref(),
        )
    })
    .await
    .map_err(ApiError::internal)?
    .map_err(ApiError::internal)?;
    Ok(Json(Value::Array(snapshots)))
}

async fn version() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}
