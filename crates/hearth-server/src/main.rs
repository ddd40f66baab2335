//! # hearth-server
//!
//! Real-time messaging server for the Hearth rental marketplace.
//!
//! This binary provides:
//! - **WebSocket gateway** where tenants, landlords and employers exchange
//!   direct and group messages with typing, receipts, reactions and presence
//! - **Content moderation** of text before delivery and of images after it
//! - **Push notifications** for participants who are offline
//! - **REST API** (axum) for health checks, stored media and user provisioning
//! - **Per-IP and per-user rate limiting** to protect against abuse

mod api;
mod cache;
mod config;
mod directory;
mod engine;
mod error;
mod gateway;
mod hub;
mod locks;
mod media;
mod moderation;
mod notifier;
mod presence;
mod rate_limit;
mod render;
mod store;
mod typing;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::cache::MessageCache;
use crate::config::ServerConfig;
use crate::engine::{EngineParts, EngineSettings, MessagingEngine};
use crate::hub::Hub;
use crate::media::LocalMediaStore;
use crate::moderation::{
    HttpModerationClient, ModerationGateway, ModerationService, ModerationSettings,
};
use crate::notifier::{HttpPushNotifier, LogNotifier, Notifier};
use crate::presence::PresenceRegistry;
use crate::rate_limit::RateLimiter;
use crate::store::SqliteStore;
use crate::typing::TypingTracker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hearth_server=debug")),
        )
        .init();

    info!("Starting Hearth messaging server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    info!(
        instance = %config.instance_name,
        moderation = config.moderation_url.is_some(),
        fail_open = config.moderation_fail_open,
        push = config.push_url.is_some(),
        admin_enabled = config.admin_token.is_some(),
        "Instance settings"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    if let Some(parent) = config.database_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let store = SqliteStore::open(&config.database_path)?;

    let media = LocalMediaStore::new(
        config.media_storage_path.clone(),
        &config.media_base_url,
        config.max_media_size,
    )
    .await?;

    let moderation_service: Option<Arc<dyn ModerationService>> = match &config.moderation_url {
        Some(url) => Some(Arc::new(HttpModerationClient::new(
            url,
            config.moderation_api_key.clone(),
            config.moderation_timeout,
        )?)),
        None => {
            warn!("MODERATION_URL not set, every moderation check counts as unavailable");
            None
        }
    };
    let moderation = ModerationGateway::new(
        moderation_service,
        ModerationSettings {
            timeout: config.moderation_timeout,
            fail_open: config.moderation_fail_open,
            scan_max_attempts: config.media_scan_max_attempts,
            ..ModerationSettings::default()
        },
    );

    let notifier: Arc<dyn Notifier> = match &config.push_url {
        Some(url) => Arc::new(HttpPushNotifier::new(url.clone(), config.push_api_key.clone())?),
        None => Arc::new(LogNotifier),
    };

    let engine = MessagingEngine::new(EngineParts {
        store: Arc::new(store),
        moderation,
        media: Arc::new(media),
        notifier,
        presence: Arc::new(PresenceRegistry::new()),
        typing: Arc::new(TypingTracker::new(config.typing_timeout)),
        cache: Arc::new(MessageCache::new(config.message_cache_size)),
        hub: Arc::new(Hub::new()),
        settings: EngineSettings {
            max_media_size: config.max_media_size,
            default_moderation_enabled: config.default_moderation_enabled,
            default_ai_scan_enabled: config.default_ai_scan_enabled,
            media_scan_delay: config.media_scan_delay,
        },
    });

    // Socket events are limited per user.
    let http_limiter = RateLimiter::default();
    let event_limiter = RateLimiter::new(config.event_rate, config.event_burst);

    let app_state = AppState {
        engine: engine.clone(),
        http_limiter: http_limiter.clone(),
        event_limiter: event_limiter.clone(),
        config: Arc::new(config.clone()),
        started_at: Instant::now(),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Typing indicators expire without an explicit stop
    let typing_engine = engine.clone();
    let sweep_every = config.typing_sweep_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            typing_engine.sweep_typing(tokio::time::Instant::now());
        }
    });

    // Rate limiter buckets idle for 10 minutes are dropped every 5
    tokio::spawn(async move {
        let idle = Duration::from_secs(600);
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let purged = http_limiter.purge_stale(idle) + event_limiter.purge_stale(idle);
            tracing::debug!(purged, "Purged idle rate limit buckets");
        }
    });

    // Housekeeping: idle conversation locks and connection stats
    let housekeeping = engine.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            housekeeping.prune_locks();
            housekeeping.hub().log_stats();
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
