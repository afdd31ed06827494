use realmkeeper::{bot, config::AppConfig, cooldown::ClaimCooldown, storage, Keeper};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging first
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realmkeeper=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Realm Keeper v{}", env!("CARGO_PKG_VERSION"));

    if dotenvy::dotenv().is_ok() {
        info!("Loaded .env");
    }

    let config = AppConfig::init()?;
    info!("Configuration loaded");

    let token = config.discord.resolve_token().ok_or_else(|| {
        error!("Discord token not configured!");
        error!("Set discord.token in config/local.toml, REALMKEEPER_DISCORD__TOKEN or DISCORD_TOKEN");
        anyhow::anyhow!("Discord token not configured")
    })?;

    // An unreadable state store is fatal here, before anything is served
    let store = storage::open_store(&config.storage).await?;
    let keeper = Arc::new(
        Keeper::open(
            store,
            config.keys.policy(),
            config.claims.one_per_member_default,
        )
        .await?,
    );

    let cooldown = Arc::new(ClaimCooldown::new(Duration::from_secs(
        config.claims.cooldown_secs,
    )));

    let maintenance = spawn_maintenance(
        keeper.clone(),
        cooldown.clone(),
        Duration::from_secs(config.maintenance.sweep_interval_secs.max(1)),
        Duration::from_secs(config.storage.retry_secs.max(1)),
    );

    info!("Starting Discord bot...");
    let bot_result = tokio::select! {
        result = bot::start_bot(keeper.clone(), cooldown, config.claims.role_grant_retries, &token) => {
            result.map_err(|e| anyhow::anyhow!("{}", e))
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    maintenance.abort();

    if !keeper.flush().await {
        warn!("Final save failed; the last changes exist only in memory");
    }

    match &bot_result {
        Ok(()) => info!("Realm Keeper shut down gracefully"),
        Err(e) => error!("Discord bot error: {}", e),
    }
    bot_result
}

/// Periodic expiry sweep, cooldown cleanup and retry of failed saves
fn spawn_maintenance(
    keeper: Arc<Keeper>,
    cooldown: Arc<ClaimCooldown>,
    sweep_every: Duration,
    retry_every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(sweep_every);
        let mut retry = tokio::time::interval(retry_every);
        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let swept = keeper.sweep_expired().await;
                    let cooled = cooldown.cleanup_expired();
                    if swept > 0 || cooled > 0 {
                        info!("Maintenance: {} expired keys, {} cooldowns removed", swept, cooled);
                    }
                }
                _ = retry.tick() => {
                    if keeper.is_dirty() && keeper.flush_if_dirty().await {
                        info!("Pending state saved");
                    }
                }
            }
        }
    })
}
