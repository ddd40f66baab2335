use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, Method},
    middleware,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use hearth_shared::constants::PROTOCOL_VERSION;
use hearth_shared::models::UserProfile;
use hearth_shared::types::{UserId, UserType};

use crate::config::ServerConfig;
use crate::engine::MessagingEngine;
use crate::error::ServerError;
use crate::gateway::ws_handler;
use crate::rate_limit::{limit_by_address, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub engine: MessagingEngine,
    pub http_limiter: RateLimiter,
    pub event_limiter: RateLimiter<UserId>,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(ws_handler))
        .route("/media/:name", get(media_download))
        .route("/admin/users/:id", put(admin_upsert_user))
        .layer(middleware::from_fn_with_state(
            state.http_limiter.clone(),
            limit_by_address,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    protocol: &'static str,
    online_users: usize,
    connections: usize,
    uptime_secs: u64,
}

#[derive(Deserialize)]
struct UpsertUserRequest {
    display_name: String,
    user_type: UserType,
    #[serde(default)]
    avatar_url: Option<String>,
    credential: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        online_users: state.engine.presence().online_count(),
        connections: state.engine.hub().connection_count(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

/// Serve a stored upload or thumbnail by file name.
async fn media_download(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let (data, content_type) = state.engine.media().open(&name).await?;
    Ok(([(header::CONTENT_TYPE, content_type)], data))
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Authorization(
            "admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Authentication("invalid admin token".into()));
    }

    Ok(())
}

/// Provision a user and their connection credential. The marketplace's
/// account system calls this whenever a profile changes.
async fn admin_upsert_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<UserId>,
    Json(req): Json<UpsertUserRequest>,
) -> Result<Json<UserProfile>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let display_name = req.display_name.trim();
    if display_name.is_empty() {
        return Err(ServerError::Validation("display_name is empty".into()));
    }
    if req.credential.is_empty() {
        return Err(ServerError::Validation("credential is empty".into()));
    }

    let user = UserProfile {
        id,
        display_name: display_name.to_string(),
        user_type: req.user_type,
        avatar_url: req.avatar_url.filter(|url| !url.trim().is_empty()),
    };
    state.engine.store().upsert_user(&user, &req.credential).await?;

    info!(user = %id, user_type = %user.user_type, "User provisioned");
    Ok(Json(user))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::engine::tests::Harness;
    use crate::store::Store;

    fn state(h: &Harness, admin_token: Option<&str>) -> AppState {
        AppState {
            engine: h.engine.clone(),
            http_limiter: RateLimiter::default(),
            event_limiter: RateLimiter::new(20.0, 40.0),
            config: Arc::new(ServerConfig {
                admin_token: admin_token.map(str::to_string),
                ..ServerConfig::default()
            }),
            started_at: Instant::now(),
        }
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn upsert(id: UserId, token: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("PUT")
            .uri(format!("/admin/users/{id}"))
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_info() {
        let h = Harness::new().await;
        let app = build_router(state(&h, None));

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");

        let alice = h.user("alice").await;
        let _client = h.connect(&alice).await;
        let response = app
            .oneshot(Request::get("/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let info = json_body(response).await;
        assert_eq!(info["protocol"], PROTOCOL_VERSION);
        assert_eq!(info["online_users"], 1);
    }

    #[tokio::test]
    async fn test_admin_upsert_requires_token() {
        let h = Harness::new().await;
        let body = r#"{"display_name":"Dana","user_type":"landlord","credential":"s3cret"}"#;
        let id = UserId::new();

        let disabled = build_router(state(&h, None));
        let response = disabled.oneshot(upsert(id, Some("x"), body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let app = build_router(state(&h, Some("admin-token")));
        let response = app
            .clone()
            .oneshot(upsert(id, Some("wrong-token"), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app.oneshot(upsert(id, Some("admin-token"), body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["display_name"], "Dana");

        let verified = h.store.verify_credential(id, "s3cret").await.unwrap();
        assert_eq!(verified.map(|u| u.user_type), Some(UserType::Landlord));
    }

    #[tokio::test]
    async fn test_admin_upsert_validates_body() {
        let h = Harness::new().await;
        let app = build_router(state(&h, Some("admin-token")));
        let body = r#"{"display_name":"  ","user_type":"tenant","credential":"c"}"#;

        let response = app
            .oneshot(upsert(UserId::new(), Some("admin-token"), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_media_download() {
        let h = Harness::new().await;
        let app = build_router(state(&h, None));

        let response = app
            .clone()
            .oneshot(Request::get("/media/missing.png").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let stored = h
            .engine
            .media()
            .store(bytes::Bytes::from_static(b"hello"), "text/plain", "note.txt")
            .await
            .unwrap();
        let name = stored.url.rsplit('/').next().unwrap().to_string();
        let response = app
            .oneshot(Request::get(format!("/media/{name}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }
}
