//! Test HTTP server for exercising request operations end to end.
//!
//! Besides a small item CRUD API it exposes endpoints with scripted failure
//! modes: per-key flaky responses, slow responses with hit counters, a
//! bearer-protected resource with token rotation, multipart echo and file
//! download. All state lives in `AppState`, so each `app()` starts clean.

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub name: String,
    pub quantity: u32,
}

#[derive(Deserialize)]
pub struct CreateItem {
    pub name: String,
    #[serde(default)]
    pub quantity: u32,
}

#[derive(Deserialize)]
pub struct UpdateItem {
    pub name: Option<String>,
    pub quantity: Option<u32>,
}

/// Hit counter payload returned by the flaky and slow endpoints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hits {
    pub key: String,
    pub hits: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub token: String,
}

/// Summary of one received multipart field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReceivedPart {
    pub field: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub content: String,
}

#[derive(Deserialize)]
pub struct FlakyParams {
    /// Requests per key that fail before the endpoint starts succeeding.
    #[serde(default)]
    pub fail: u32,
    #[serde(default = "default_failure_status")]
    pub status: u16,
}

fn default_failure_status() -> u16 {
    500
}

#[derive(Deserialize)]
pub struct SlowParams {
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Clone, Default)]
pub struct AppState {
    items: Arc<RwLock<HashMap<Uuid, Item>>>,
    hits: Arc<RwLock<HashMap<String, u32>>>,
    token_generation: Arc<RwLock<u32>>,
}

impl AppState {
    async fn hit(&self, key: &str) -> u32 {
        let mut hits = self.hits.write().await;
        let count = hits.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}

pub fn app() -> Router {
    Router::new()
        .route("/items", get(list_items).post(create_item))
        .route("/items/{id}", get(get_item).put(update_item).delete(delete_item))
        .route("/flaky/{key}", get(flaky))
        .route("/slow/{key}", get(slow))
        .route("/hits/{key}", get(hits))
        .route("/auth/refresh", post(refresh_token))
        .route("/protected", get(protected))
        .route("/upload", post(upload))
        .route("/download/{name}", get(download))
        .with_state(AppState::default())
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

async fn list_items(State(state): State<AppState>) -> Json<Vec<Item>> {
    let items = state.items.read().await;
    Json(items.values().cloned().collect())
}

async fn create_item(
    State(state): State<AppState>,
    Json(input): Json<CreateItem>,
) -> (StatusCode, Json<Item>) {
    let item = Item {
        id: Uuid::new_v4(),
        name: input.name,
        quantity: input.quantity,
    };
    state.items.write().await.insert(item.id, item.clone());
    (StatusCode::CREATED, Json(item))
}

async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Item>, StatusCode> {
    let items = state.items.read().await;
    items.get(&id).cloned().map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn update_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateItem>,
) -> Result<Json<Item>, StatusCode> {
    let mut items = state.items.write().await;
    let item = items.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
    if let Some(name) = input.name {
        item.name = name;
    }
    if let Some(quantity) = input.quantity {
        item.quantity = quantity;
    }
    Ok(Json(item.clone()))
}

async fn delete_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    let mut items = state.items.write().await;
    items
        .remove(&id)
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn flaky(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<FlakyParams>,
) -> Result<Json<Hits>, StatusCode> {
    let hits = state.hit(&key).await;
    if hits <= params.fail {
        debug!(%key, hits, status = params.status, "flaky endpoint failing");
        let status =
            StatusCode::from_u16(params.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return Err(status);
    }
    Ok(Json(Hits { key, hits }))
}

async fn slow(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<SlowParams>,
) -> Json<Hits> {
    let hits = state.hit(&key).await;
    tokio::time::sleep(Duration::from_millis(params.delay_ms)).await;
    Json(Hits { key, hits })
}

async fn hits(State(state): State<AppState>, Path(key): Path<String>) -> Json<Hits> {
    let hits = state.hits.read().await.get(&key).copied().unwrap_or(0);
    Json(Hits { key, hits })
}

async fn refresh_token(State(state): State<AppState>) -> Json<Token> {
    let mut generation = state.token_generation.write().await;
    *generation += 1;
    debug!(generation = *generation, "issued new token");
    Json(Token {
        token: format!("token-{}", *generation),
    })
}

/// 401 unless the request carries the most recently issued token.
async fn protected(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Hits>, StatusCode> {
    let generation = *state.token_generation.read().await;
    let expected = format!("Bearer token-{generation}");
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if generation == 0 || presented != Some(expected.as_str()) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let hits = state.hit("protected").await;
    Ok(Json(Hits {
        key: "protected".to_string(),
        hits,
    }))
}

async fn upload(mut multipart: Multipart) -> Result<Json<Vec<ReceivedPart>>, StatusCode> {
    let mut parts = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
        parts.push(ReceivedPart {
            field: field_name,
            file_name,
            content_type,
            content: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    Ok(Json(parts))
}

async fn download(Path(name): Path<String>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        format!("contents of {name}"),
    )
}
