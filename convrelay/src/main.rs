mod server;

use anyhow::Result;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::info;

use convrelay_api::http::{AppState, UpstreamClient};
use convrelay_core::auth::TokenService;
use convrelay_core::models::ServerId;
use convrelay_core::{logging, Config};
use convrelay_routing::{
    ConversationRegistry, EventRouter, MemoryRegistry, OwnershipManager, RedisRegistry, RoomHub,
    RoutingChannel,
};

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. CONVRELAY_CONFIG_PATH environment variable (explicit path)
/// 2. ./config.yaml (current working directory)
/// 3. /config/config.yaml (Kubernetes mount path)
/// 4. Fall back to environment variables only
fn load_config() -> Result<Config> {
    let config_path = std::env::var("CONVRELAY_CONFIG_PATH")
        .ok()
        .filter(|p| std::path::Path::new(p).exists())
        .or_else(|| {
            let cwd = "config.yaml";
            std::path::Path::new(cwd).exists().then(|| cwd.to_string())
        })
        .or_else(|| {
            let k8s = "/config/config.yaml";
            std::path::Path::new(k8s).exists().then(|| k8s.to_string())
        });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        match Config::from_file(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load {path}: {e}");
                eprintln!("Falling back to environment variables");
                Config::from_env().unwrap_or_default()
            }
        }
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env().unwrap_or_default()
    };

    // Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration
    let config = load_config()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("ConvRelay server starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Instance identity, fixed for the process lifetime
    let server_id = ServerId::generate();
    info!(server_id = %server_id, "Instance identity generated");

    // 4. Session token service (loads the secret key file)
    let tokens = Arc::new(TokenService::from_config(&config.jwt)?);

    // 5. Local room hub
    let hub = Arc::new(RoomHub::new());

    // 6. Ownership registry and routing channel
    let (registry, publish_tx, routing_channel): (
        Arc<dyn ConversationRegistry>,
        _,
        Option<Arc<RoutingChannel>>,
    ) = if config.is_clustered() {
        let registry = RedisRegistry::connect(
            config.redis_url(),
            Duration::from_secs(config.redis.connect_timeout_seconds),
        )
        .await?;

        let channel = Arc::new(RoutingChannel::new(
            config.redis_url(),
            hub.clone(),
            server_id.clone(),
        )?);
        let publish_tx = channel.clone().start().await?;

        info!("Routing channel started, cross-instance delivery enabled");
        (Arc::new(registry), publish_tx, Some(channel))
    } else {
        info!("Redis not configured, running in single-instance mode");
        (
            Arc::new(MemoryRegistry::new()),
            RoutingChannel::start_local(hub.clone()),
            None,
        )
    };

    // 7. Ownership manager and inbound event router
    let ownership = Arc::new(OwnershipManager::new(
        server_id,
        registry.clone(),
        hub.clone(),
    ));
    let router = Arc::new(EventRouter::new(registry, publish_tx));

    // 8. Upstream API client for the proxy endpoints
    let upstream = Arc::new(UpstreamClient::from_config(&config.upstream)?);

    let state = AppState {
        tokens,
        auth: config.auth.clone(),
        ownership,
        hub,
        router,
        upstream,
    };

    // 9. Serve until shutdown
    server::run(config, state, routing_channel).await
}
