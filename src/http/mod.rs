use std::{collections::VecDeque, convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    extract::{Extension, FromRequest, Path, Request},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use chrono::{SecondsFormat, Utc};
use futures_util::{Stream, stream};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use tokio::{
    sync::{Mutex, broadcast, mpsc},
    time::Duration,
};
use tracing::info;

use crate::{
    domain::{Device, DomainError, Rgb},
    propagate::PropagationHandle,
    state::{JsonSnapshotStore, Registration, StoreError},
    viewers::{StateUpdate, ViewerHub},
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Mutex<JsonSnapshotStore>>,
    pub propagation: PropagationHandle,
    pub viewers: ViewerHub,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<DomainError> for ApiError {
    fn from(value: DomainError) -> Self {
        match &value {
            DomainError::MissingDevice { name } => {
                ApiError::not_found(value.to_string()).with_detail("device", name.as_str())
            }
            DomainError::InvalidDeviceName { name, .. }
            | DomainError::EmptyStateChange { name } => {
                ApiError::invalid_request(value.to_string()).with_detail("device", name.as_str())
            }
            DomainError::InvalidAddress { address, .. } => {
                ApiError::invalid_request(value.to_string()).with_detail("address", address.as_str())
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Domain(domain) => domain.into(),
            StoreError::SchemaVersionMismatch { .. } => ApiError::internal(value.to_string()),
            StoreError::Io(_) | StoreError::SerdeJson(_) => ApiError::internal(value.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

#[derive(Serialize)]
struct Items<T> {
    items: Vec<T>,
}

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

#[derive(Debug, Deserialize)]
struct RegisterDeviceRequest {
    name: String,
    #[serde(alias = "ip")]
    address: String,
}

#[derive(Debug, Deserialize)]
struct PutDeviceStateRequest {
    #[serde(default)]
    rgb: Option<Rgb>,
    #[serde(default, deserialize_with = "deserialize_power")]
    power: Option<bool>,
}

/// Older clients send power as `0`/`1`.
fn deserialize_power<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PowerInput {
        Bool(bool),
        Int(i64),
    }

    match PowerInput::deserialize(deserializer)? {
        PowerInput::Bool(value) => Ok(Some(value)),
        PowerInput::Int(0) => Ok(Some(false)),
        PowerInput::Int(1) => Ok(Some(true)),
        PowerInput::Int(other) => Err(serde::de::Error::custom(format!(
            "power must be a boolean, 0 or 1, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, Serialize)]
struct EventsSseHello {
    connected_at: String,
    version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct EventsSseLagged {
    missed: u64,
}

pub fn build_router(
    store: Arc<Mutex<JsonSnapshotStore>>,
    propagation: PropagationHandle,
    viewers: ViewerHub,
) -> Router {
    let app_state = AppState {
        store,
        propagation,
        viewers,
    };

    Router::new()
        .route("/health", get(health))
        .route("/devices", get(list_devices).post(register_device))
        .route("/devices/:name", get(get_device).put(put_device_state))
        .route("/events", get(stream_events))
        .fallback(fallback_not_found)
        .layer(Extension(app_state))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": crate::version::VERSION,
    }))
}

async fn list_devices(
    Extension(state): Extension<AppState>,
) -> Result<Json<Items<Device>>, ApiError> {
    let store = state.store.lock().await;
    Ok(Json(Items {
        items: store.list_devices(),
    }))
}

async fn register_device(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<RegisterDeviceRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let registration = {
        let mut store = state.store.lock().await;
        store.register_device(req.name, req.address)?
    };
    let device = registration.device();
    state.propagation.request_device(device.name.clone());

    match &registration {
        Registration::Created(device) => {
            info!(device = %device.name, address = %device.address, "device registered");
            Ok((
                StatusCode::CREATED,
                Json(MessageResponse {
                    message: "device created",
                }),
            ))
        }
        Registration::Updated(device) => {
            info!(device = %device.name, address = %device.address, "device re-registered");
            Ok((
                StatusCode::OK,
                Json(MessageResponse {
                    message: "device already exists",
                }),
            ))
        }
    }
}

async fn get_device(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Device>, ApiError> {
    let store = state.store.lock().await;
    let device = store
        .get_device(&name)
        .ok_or(DomainError::MissingDevice { name })?;
    Ok(Json(device))
}

async fn put_device_state(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
    ApiJson(req): ApiJson<PutDeviceStateRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    {
        let mut store = state.store.lock().await;
        let current = store
            .get_device(&name)
            .ok_or_else(|| DomainError::MissingDevice { name: name.clone() })?;
        if req.rgb.is_none() && req.power.is_none() {
            return Err(DomainError::EmptyStateChange { name }.into());
        }
        store.update_device_state(
            &name,
            req.rgb.unwrap_or(current.color),
            req.power.unwrap_or(current.power),
        )?;
    }
    state.propagation.request_device(name);

    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            message: "status changed",
        }),
    ))
}

async fn stream_events(
    Extension(state): Extension<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + Send>, ApiError> {
    let hello = EventsSseHello {
        connected_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        version: crate::version::VERSION,
    };
    let mut initial_events = VecDeque::new();
    initial_events.push_back(sse_json_event("hello", &hello));

    // Subscribe before reading the snapshot so no broadcast falls between the two.
    let updates = state.viewers.subscribe();
    let snapshot = StateUpdate {
        sent_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        devices: state.store.lock().await.list_devices(),
    };
    initial_events.push_back(sse_json_event("snapshot", &snapshot));

    let (tx, rx) = mpsc::channel::<Event>(512);
    tokio::spawn(async move {
        forward_state_updates(updates, tx).await;
    });

    let out_stream = stream::unfold((initial_events, rx), |(mut initial, mut rx)| async move {
        if let Some(event) = initial.pop_front() {
            return Some((Ok(event), (initial, rx)));
        }
        let next = rx.recv().await?;
        Some((Ok(next), (initial, rx)))
    });

    Ok(Sse::new(out_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("keepalive"),
    ))
}

async fn forward_state_updates(
    mut updates: broadcast::Receiver<StateUpdate>,
    tx: mpsc::Sender<Event>,
) {
    loop {
        if tx.is_closed() {
            return;
        }
        match updates.recv().await {
            Ok(update) => {
                if tx.send(sse_json_event("state", &update)).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                let _ = tx
                    .send(sse_json_event("lagged", &EventsSseLagged { missed }))
                    .await;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn sse_json_event<T: Serialize>(event: &'static str, payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(data) => Event::default().event(event).data(data),
        Err(err) => Event::default().event("error").data(err.to_string()),
    }
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}
