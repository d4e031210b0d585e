use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::admin::PolicyAdmin;
use crate::config::Config;
use crate::discord::{DiscordConnector, DiscordHttpClient};
use crate::discord::types::API_BASE;
use crate::retention::{
    ArrivalConsumer, ArrivalEvent, ChannelCountCache, ChatPlatform, EnforcerSettings,
    OperationKind, OperationRateLimiter, RateLimiterSettings, RetentionEnforcer,
    RetentionServices,
};
use crate::store::{CachedPolicyStore, ControlStore, PolicyStore, SqlitePolicyStore};

mod listener;

pub use listener::{ArrivalSource, ListenFuture, spawn_supervised_listener};

const LISTENER_INITIAL_BACKOFF_SECS: u64 = 2;
const LISTENER_MAX_BACKOFF_SECS: u64 = 60;
const ARRIVAL_QUEUE_CAPACITY: usize = 256;
pub const LEASE_TTL: Duration = Duration::from_secs(30);
const CONTROL_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Lease holder name: role plus a per-process id.
pub fn lease_holder_id(role: &str) -> String {
    format!("{role}:{}", Uuid::new_v4())
}

/// Engine services wired from config around the given platform and store.
pub fn retention_services(
    config: &Config,
    platform: Arc<dyn ChatPlatform>,
    policies: Arc<dyn PolicyStore>,
) -> RetentionServices {
    RetentionServices {
        platform,
        policies,
        counts: Arc::new(ChannelCountCache::new()),
        fetch_limiter: Arc::new(OperationRateLimiter::new(
            OperationKind::Fetch,
            RateLimiterSettings::from(&config.rate_limits.fetch),
        )),
        delete_limiter: Arc::new(OperationRateLimiter::new(
            OperationKind::Delete,
            RateLimiterSettings::from(&config.rate_limits.delete),
        )),
    }
}

pub fn enforcer_settings(config: &Config) -> EnforcerSettings {
    EnforcerSettings {
        history_window: config.retention.history_window,
    }
}

pub fn discord_client(config: &Config) -> Result<DiscordHttpClient> {
    if config.discord.bot_token.trim().is_empty() {
        bail!(
            "Discord bot token is not set; add [discord] bot_token to {} or set DISCORD_TOKEN",
            config.config_path.display()
        );
    }
    let api_base = config.discord.api_base.as_deref().unwrap_or(API_BASE);
    Ok(DiscordHttpClient::with_api_base(
        config.discord.bot_token.clone(),
        api_base,
    ))
}

pub async fn open_policy_store(config: &Config) -> Result<CachedPolicyStore<SqlitePolicyStore>> {
    let store = SqlitePolicyStore::open(&config.db_path()).await?;
    Ok(CachedPolicyStore::new(
        store,
        Duration::from_secs(config.retention.policy_cache_ttl_secs),
    ))
}

/// Long-running bot: gateway listener plus one enforcement task per arrival.
pub async fn run(config: Arc<Config>) -> Result<()> {
    let http = Arc::new(discord_client(&config)?);
    let me = http
        .get_current_user()
        .await
        .context("verify Discord bot token")?;
    let bot_name = me
        .get("username")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("unknown");

    let db_path = config.db_path();
    let control = Arc::new(ControlStore::open(&db_path).await?);
    let holder = lease_holder_id("daemon");
    if !control.try_acquire_lease(&holder, LEASE_TTL).await? {
        let current = control
            .lease_holder()
            .await?
            .map_or_else(|| "unknown".to_string(), |(name, _)| name);
        bail!("another ServerMaid instance is already running ({current})");
    }

    let policies: Arc<dyn PolicyStore> = Arc::new(open_policy_store(&config).await?);
    let platform: Arc<dyn ChatPlatform> = Arc::clone(&http) as Arc<dyn ChatPlatform>;
    let services = retention_services(&config, platform, policies);
    let counts = Arc::clone(&services.counts);
    let enforcer = Arc::new(RetentionEnforcer::new(services, enforcer_settings(&config)));
    let admin = Arc::new(PolicyAdmin::new(Arc::clone(&enforcer)));
    let control_loop = spawn_control_loop(
        Arc::clone(&control),
        holder.clone(),
        Some(admin),
        CONTROL_POLL_INTERVAL,
    );

    let source: Arc<dyn ArrivalSource> = Arc::new(DiscordConnector::new(
        config.discord.clone(),
        Arc::clone(&http),
        counts,
    ));
    let (tx, rx) = mpsc::channel::<ArrivalEvent>(ARRIVAL_QUEUE_CAPACITY);
    let listener = spawn_supervised_listener(
        source,
        tx,
        LISTENER_INITIAL_BACKOFF_SECS,
        LISTENER_MAX_BACKOFF_SECS,
    );

    tracing::info!(
        bot = bot_name,
        db = %db_path.display(),
        "ServerMaid started; press Ctrl+C to stop"
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {e}");
        }
    };
    dispatch_arrivals(enforcer as Arc<dyn ArrivalConsumer>, rx, shutdown).await;

    tracing::info!("shutdown requested");
    listener.abort();
    let _ = listener.await;
    control_loop.abort();
    let _ = control_loop.await;
    if let Err(e) = control.release_lease(&holder).await {
        tracing::warn!("failed to release instance lease: {e:#}");
    }
    Ok(())
}

/// Keep `holder`'s lease alive until the returned task is aborted.
pub fn spawn_lease_keeper(control: Arc<ControlStore>, holder: String) -> JoinHandle<()> {
    spawn_control_loop(control, holder, None, CONTROL_POLL_INTERVAL)
}

/// Keep `holder`'s lease alive every `poll`. With an `admin`, also carry out
/// queued requests.
pub fn spawn_control_loop(
    control: Arc<ControlStore>,
    holder: String,
    admin: Option<Arc<PolicyAdmin>>,
    poll: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll);
        loop {
            interval.tick().await;
            match control.try_acquire_lease(&holder, LEASE_TTL).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::error!(%holder, "instance lease was taken by another process");
                }
                Err(e) => tracing::warn!("failed to renew instance lease: {e:#}"),
            }

            if let Some(admin) = &admin {
                match drain_requests(&control, admin).await {
                    Ok(mut applying) => applying.detach_all(),
                    Err(e) => tracing::warn!("failed to read control requests: {e:#}"),
                }
            }
        }
    })
}

/// Start one task per queued request. Returns the tasks so callers can wait.
pub async fn drain_requests(
    control: &ControlStore,
    admin: &Arc<PolicyAdmin>,
) -> Result<JoinSet<()>> {
    let mut applying = JoinSet::new();
    for request in control.take_requests().await? {
        tracing::debug!(?request, "control request received");
        let admin = Arc::clone(admin);
        applying.spawn(async move {
            if let Err(e) = admin.apply(request).await {
                tracing::warn!("control request failed: {e:#}");
            }
        });
    }
    Ok(applying)
}

/// Hand every arrival to `consumer` on its own task until the stream ends or
/// `shutdown` resolves. In-flight passes are awaited before returning.
pub async fn dispatch_arrivals<S>(
    consumer: Arc<dyn ArrivalConsumer>,
    mut rx: mpsc::Receiver<ArrivalEvent>,
    shutdown: S,
) where
    S: Future<Output = ()>,
{
    let mut in_flight = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            event = rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                let consumer = Arc::clone(&consumer);
                in_flight.spawn(async move { consumer.on_arrival(event).await });
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!("enforcement task failed: {e}");
                }
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            tracing::error!("enforcement task failed: {e}");
        }
    }
}
