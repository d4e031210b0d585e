//! Discord transport: REST client (the engine's [`ChatPlatform`]) and the
//! gateway connection that produces arrival events.
//!
//! [`ChatPlatform`]: crate::retention::ChatPlatform

pub mod gateway;
pub mod http_client;
pub mod types;
pub mod welcome;

pub use self::http_client::DiscordHttpClient;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::config::DiscordConfig;
use crate::daemon::{ArrivalSource, ListenFuture};
use crate::retention::{ArrivalEvent, ChannelCountCache};

use self::gateway::{DiscordGateway, DiscordGatewayState, GatewayEvent, GuildChannel};
use self::types::{DEFAULT_ACTIVITY_NAME, DEFAULT_INTENTS, snowflake_timestamp};

pub struct DiscordConnector {
    http: Arc<DiscordHttpClient>,
    gateway_state: Arc<DiscordGatewayState>,
    config: DiscordConfig,
    counts: Arc<ChannelCountCache>,
    bot_user_id: Mutex<Option<String>>,
    known_guilds: Mutex<HashSet<String>>,
}

/// What the connector does with a gateway event.
#[derive(Debug, PartialEq)]
enum Routed {
    Arrival(ArrivalEvent),
    /// The bot was added to a server.
    Joined {
        guild_name: String,
        channels: Vec<GuildChannel>,
    },
}

impl DiscordConnector {
    pub fn new(
        config: DiscordConfig,
        http: Arc<DiscordHttpClient>,
        counts: Arc<ChannelCountCache>,
    ) -> Self {
        Self {
            http,
            gateway_state: Arc::new(DiscordGatewayState::default()),
            config,
            counts,
            bot_user_id: Mutex::new(None),
            known_guilds: Mutex::new(HashSet::new()),
        }
    }

    fn intents(&self) -> u64 {
        self.config.intents.unwrap_or(DEFAULT_INTENTS)
    }

    fn build_presence(&self) -> serde_json::Value {
        let status = self.config.status.as_deref().unwrap_or("online");
        let activity_name = self
            .config
            .activity_name
            .as_deref()
            .unwrap_or(DEFAULT_ACTIVITY_NAME);
        let activity_type = self.config.activity_type.unwrap_or(0);

        serde_json::json!({
            "status": status,
            "activities": [{
                "name": activity_name,
                "type": activity_type,
            }],
            "since": null,
            "afk": false,
        })
    }

    fn set_bot_user_id(&self, user_id: &str) {
        if let Ok(mut guard) = self.bot_user_id.lock() {
            *guard = Some(user_id.to_string());
        }
    }

    fn is_bot_user(&self, user_id: &str) -> bool {
        self.bot_user_id
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .is_some_and(|id| id == user_id)
    }

    fn lock_known_guilds(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.known_guilds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Route a gateway event, or `None` when it needs no action.
    fn handle_gateway_event(&self, event: GatewayEvent) -> Option<Routed> {
        match event {
            GatewayEvent::Ready {
                user_id, guild_ids, ..
            } => {
                self.set_bot_user_id(&user_id);
                let guilds = guild_ids.len();
                *self.lock_known_guilds() = guild_ids.into_iter().collect();
                let dropped = self.counts.len();
                self.counts.clear();
                tracing::info!(
                    user_id,
                    guilds,
                    dropped,
                    "Discord: connected; cached counts reset"
                );
                None
            }
            GatewayEvent::GuildCreate {
                guild_id,
                name,
                channels,
            } => {
                if !self.lock_known_guilds().insert(guild_id.clone()) {
                    return None;
                }
                tracing::info!(%guild_id, guild = %name, "Discord: joined new server");
                Some(Routed::Joined {
                    guild_name: name,
                    channels,
                })
            }
            GatewayEvent::MessageCreate {
                guild_id,
                channel_id,
                message_id,
                author_id,
                timestamp,
                pinned,
                ..
            } => {
                let Some(server_id) = guild_id else {
                    tracing::trace!(channel_id, "Discord: ignoring direct message");
                    return None;
                };
                if self.is_bot_user(&author_id) {
                    return None;
                }
                let created_at = timestamp
                    .as_deref()
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|ts| ts.with_timezone(&Utc))
                    .or_else(|| snowflake_timestamp(&message_id))
                    .unwrap_or_else(Utc::now);
                Some(Routed::Arrival(ArrivalEvent {
                    server_id,
                    channel_id,
                    message_id,
                    created_at,
                    pinned,
                }))
            }
        }
    }

    async fn listen_once(
        &self,
        tx: tokio::sync::mpsc::Sender<ArrivalEvent>,
    ) -> anyhow::Result<()> {
        let gateway = DiscordGateway::new(
            self.config.bot_token.clone(),
            self.intents(),
            Arc::clone(&self.gateway_state),
            Some(self.build_presence()),
        );

        let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<GatewayEvent>(100);

        let mut gateway_handle = {
            let http = Arc::clone(&self.http);
            tokio::spawn(async move { gateway.connect_and_listen(&http, &event_tx).await })
        };

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    match self.handle_gateway_event(event) {
                        Some(Routed::Arrival(arrival)) => {
                            if tx.send(arrival).await.is_err() {
                                gateway_handle.abort();
                                break;
                            }
                        }
                        Some(Routed::Joined { guild_name, channels }) => {
                            let http = Arc::clone(&self.http);
                            tokio::spawn(async move {
                                welcome::send_welcome(&http, &guild_name, &channels).await;
                            });
                        }
                        None => {}
                    }
                }
                result = &mut gateway_handle => {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => return Err(e),
                        Err(e) => anyhow::bail!("Discord gateway task panicked: {e}"),
                    }
                    break;
                }
            }
        }

        Ok(())
    }
}

impl ArrivalSource for DiscordConnector {
    fn name(&self) -> &str {
        "discord"
    }

    fn listen<'a>(&'a self, tx: tokio::sync::mpsc::Sender<ArrivalEvent>) -> ListenFuture<'a> {
        Box::pin(self.listen_once(tx))
    }
}
