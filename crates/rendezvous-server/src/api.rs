//! HTTP adapter: route wiring, header and path-parameter parsing.
//!
//! Bodies are wire-encoded records both ways; binary header parameters
//! are base64, topic and message ids in paths are base32. Every mutating
//! route follows the same shape: lock the core, run the handler,
//! snapshot, release, then dispatch push notifications.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use rendezvous_shared::records::{
    InternalUser, RegistrationBundle, Topic, TopicKeyBundle, TopicKeyRequest, TopicUpdateUpload,
};
use rendezvous_shared::records::DevicePrekeyUploadRequest;
use rendezvous_shared::types::{DeviceKey, MessageId, TopicId, UserKey};
use rendezvous_shared::wire::WireRecord;

use crate::error::ServerError;
use crate::handlers::{self, now, AppState, UserAuth};

pub fn build_router(state: Arc<AppState>, static_files: Option<PathBuf>) -> Router {
    let mut router = Router::new()
        .route("/ping", get(ping))
        .route("/admin/renew", get(admin_renew))
        .route("/admin/reset", get(admin_reset))
        .route("/admin/accounts", get(admin_accounts))
        .route("/admin/allow", post(admin_allow))
        .route("/admin/delete", post(admin_delete))
        .route("/user/register", post(user_register))
        .route("/user/info", get(user_info))
        .route("/user/delete", post(user_delete))
        .route("/device/register", post(device_register))
        .route("/device/push", post(device_push))
        .route("/device/delete", post(device_delete))
        .route("/device/prekeys", post(device_prekeys))
        .route("/user/prekeys", get(user_prekeys))
        .route("/user/topickeys", post(user_topickeys))
        .route("/user/topickey", get(user_topickey))
        .route("/users/topickey", post(users_topickey))
        .route("/topic/create", post(topic_create))
        .route("/topic/message", post(topic_message))
        .route("/topic/range/{topic_id}", get(topic_range))
        .route("/files/{topic_id}/{message_id}", get(file_get))
        .route("/device/messages", get(device_messages))
        .with_state(state);
    if let Some(dir) = static_files {
        router = router.fallback_service(ServeDir::new(dir));
    }
    router.layer(TraceLayer::new_for_http())
}

pub async fn serve(
    state: Arc<AppState>,
    addr: std::net::SocketAddr,
    static_files: Option<PathBuf>,
) -> anyhow::Result<()> {
    let router = build_router(state, static_files);
    info!(addr = %addr, "HTTP adapter listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

// --- parameter parsing ---

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ServerError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServerError::InvalidRequest(format!("missing header '{name}'")))
}

fn header_bytes(headers: &HeaderMap, name: &str) -> Result<Vec<u8>, ServerError> {
    let raw = header_str(headers, name)?;
    STANDARD
        .decode(raw)
        .map_err(|_| ServerError::InvalidRequest(format!("header '{name}' is not valid base64")))
}

fn header_u32(headers: &HeaderMap, name: &str) -> Result<u32, ServerError> {
    header_str(headers, name)?
        .parse()
        .map_err(|_| ServerError::InvalidRequest(format!("header '{name}' is not a number")))
}

fn user_auth(headers: &HeaderMap) -> Result<UserAuth, ServerError> {
    let user = header_bytes(headers, "user")?;
    let device = header_bytes(headers, "device")?;
    let token = header_bytes(headers, "auth")?;
    Ok(UserAuth {
        user: UserKey::from_slice(&user)
            .ok_or_else(|| ServerError::InvalidRequest("malformed user key".to_string()))?,
        device: DeviceKey::from_slice(&device)
            .ok_or_else(|| ServerError::InvalidRequest("malformed device key".to_string()))?,
        token,
    })
}

fn topic_id_param(raw: &str) -> Result<TopicId, ServerError> {
    TopicId::from_base32(raw)
        .ok_or_else(|| ServerError::InvalidRequest("malformed topic id".to_string()))
}

fn message_id_param(raw: &str) -> Result<MessageId, ServerError> {
    MessageId::from_base32(raw)
        .ok_or_else(|| ServerError::InvalidRequest("malformed message id".to_string()))
}

// --- routes ---

async fn ping() -> StatusCode {
    StatusCode::OK
}

async fn admin_renew(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Vec<u8>, ServerError> {
    let token = header_bytes(&headers, "auth")?;
    let mut core = state.core.lock().await;
    let new_token = handlers::admin::renew_token(&mut core, &token)?;
    core.snapshot().await;
    Ok(new_token.as_bytes().to_vec())
}

async fn admin_reset(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, ServerError> {
    let token = header_bytes(&headers, "auth")?;
    let mut core = state.core.lock().await;
    handlers::admin::reset(&mut core, &token).await?;
    core.snapshot().await;
    Ok(StatusCode::OK)
}

async fn admin_accounts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<String, ServerError> {
    let token = header_bytes(&headers, "auth")?;
    let core = state.core.lock().await;
    handlers::admin::list_accounts(&core, &token)
}

async fn admin_allow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Vec<u8>, ServerError> {
    let token = header_bytes(&headers, "auth")?;
    let name = header_str(&headers, "username")?.to_string();
    let mut core = state.core.lock().await;
    let entry = handlers::admin::allow_user(&mut core, &token, &name, now())?;
    core.snapshot().await;
    Ok(entry.encode())
}

async fn admin_delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, ServerError> {
    let token = header_bytes(&headers, "auth")?;
    let user = header_bytes(&headers, "user")?;
    let user = UserKey::from_slice(&user)
        .ok_or_else(|| ServerError::InvalidRequest("malformed user key".to_string()))?;
    let mut core = state.core.lock().await;
    handlers::admin::delete_user(&mut core, &token, &user).await?;
    core.snapshot().await;
    Ok(StatusCode::OK)
}

async fn user_register(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Vec<u8>, ServerError> {
    let bundle = RegistrationBundle::decode(&body)?;
    // the pin travels in the header; older clients put it in the bundle
    let pin = match headers.get("pin") {
        Some(_) => header_u32(&headers, "pin")?,
        None => bundle.pin,
    };
    let mut core = state.core.lock().await;
    let token = handlers::user::register(&mut core, bundle, pin, now()).await?;
    core.snapshot().await;
    Ok(token.as_bytes().to_vec())
}

async fn user_info(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Vec<u8>, ServerError> {
    let auth = user_auth(&headers)?;
    let core = state.core.lock().await;
    let record = handlers::user::get_info(&core, &auth)?;
    Ok(record.encode())
}

async fn user_delete(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    let record = InternalUser::decode(&body)?;
    let mut core = state.core.lock().await;
    handlers::user::delete(&mut core, record, now()).await?;
    core.snapshot().await;
    Ok(StatusCode::OK)
}

async fn device_register(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Vec<u8>, ServerError> {
    let record = InternalUser::decode(&body)?;
    let mut core = state.core.lock().await;
    let token = handlers::device::register(&mut core, record, now())?;
    core.snapshot().await;
    Ok(token.as_bytes().to_vec())
}

async fn device_push(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    let auth = user_auth(&headers)?;
    let mut core = state.core.lock().await;
    handlers::device::set_push_token(&mut core, &auth, &body)?;
    core.snapshot().await;
    Ok(StatusCode::OK)
}

async fn device_delete(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    let record = InternalUser::decode(&body)?;
    let mut core = state.core.lock().await;
    handlers::device::delete(&mut core, record, now()).await?;
    core.snapshot().await;
    Ok(StatusCode::OK)
}

async fn device_prekeys(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    let request = DevicePrekeyUploadRequest::decode(&body)?;
    let mut core = state.core.lock().await;
    handlers::keys::add_prekeys(&mut core, request).await?;
    core.snapshot().await;
    Ok(StatusCode::OK)
}

async fn user_prekeys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Vec<u8>, ServerError> {
    let auth = user_auth(&headers)?;
    let count = header_u32(&headers, "count")? as u64;
    let mut core = state.core.lock().await;
    let bundle = handlers::keys::get_prekeys(&mut core, &auth, count).await?;
    core.snapshot().await;
    Ok(bundle.encode())
}

async fn user_topickeys(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    let bundle = TopicKeyBundle::decode(&body)?;
    let mut core = state.core.lock().await;
    let targets = handlers::keys::add_topic_keys(&mut core, bundle).await?;
    core.snapshot().await;
    drop(core);
    state.push.dispatch(targets).await;
    Ok(StatusCode::OK)
}

async fn user_topickey(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Vec<u8>, ServerError> {
    let auth = user_auth(&headers)?;
    let receiver = header_bytes(&headers, "receiver")?;
    let receiver = UserKey::from_slice(&receiver)
        .ok_or_else(|| ServerError::InvalidRequest("malformed receiver key".to_string()))?;
    let application = header_str(&headers, "app")?.to_string();
    let mut core = state.core.lock().await;
    let key = handlers::keys::get_topic_key(&mut core, &auth, &receiver, &application).await?;
    core.snapshot().await;
    Ok(key.encode())
}

async fn users_topickey(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Vec<u8>, ServerError> {
    let request = TopicKeyRequest::decode(&body)?;
    let mut core = state.core.lock().await;
    let response = handlers::keys::get_topic_keys(&mut core, request).await?;
    core.snapshot().await;
    Ok(response.encode())
}

async fn topic_create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    let auth = user_auth(&headers)?;
    let topic = Topic::decode(&body)?;
    let mut core = state.core.lock().await;
    let targets = handlers::topic::create(&mut core, &auth, topic, now()).await?;
    core.snapshot().await;
    drop(core);
    state.push.dispatch(targets).await;
    Ok(StatusCode::OK)
}

async fn topic_message(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Vec<u8>, ServerError> {
    let upload = TopicUpdateUpload::decode(&body)?;
    let mut core = state.core.lock().await;
    let (chain, targets) = handlers::topic::add_message(&mut core, upload).await?;
    core.snapshot().await;
    drop(core);
    state.push.dispatch(targets).await;
    Ok(chain.encode())
}

async fn topic_range(
    State(state): State<Arc<AppState>>,
    Path(topic_id): Path<String>,
    headers: HeaderMap,
) -> Result<Vec<u8>, ServerError> {
    let auth = user_auth(&headers)?;
    let topic_id = topic_id_param(&topic_id)?;
    let start = header_u32(&headers, "start")?;
    let count = header_u32(&headers, "count")?;
    let core = state.core.lock().await;
    let chain = handlers::topic::get_range(&core, &auth, &topic_id, start, count).await?;
    Ok(chain.encode())
}

async fn file_get(
    State(state): State<Arc<AppState>>,
    Path((topic_id, message_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Vec<u8>, ServerError> {
    let auth = user_auth(&headers)?;
    let topic_id = topic_id_param(&topic_id)?;
    let message_id = message_id_param(&message_id)?;
    let core = state.core.lock().await;
    handlers::topic::get_file(&core, &auth, &topic_id, &message_id).await
}

async fn device_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Vec<u8>, ServerError> {
    let auth = user_auth(&headers)?;
    let mut core = state.core.lock().await;
    let (download, targets) = handlers::topic::get_messages(&mut core, &auth)?;
    core.snapshot().await;
    drop(core);
    state.push.dispatch(targets).await;
    Ok(download.encode())
}
