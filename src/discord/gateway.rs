use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::{Instant, interval};
use tokio_tungstenite::tungstenite::Message;

use super::http_client::DiscordHttpClient;
use super::types::{DEFAULT_HEARTBEAT_INTERVAL_MS, GatewayOpcode};

#[derive(Debug)]
pub struct DiscordGatewayState {
    pub session_id: Mutex<Option<String>>,
    pub sequence: AtomicI64,
    pub resume_gateway_url: Mutex<Option<String>>,
}

impl Default for DiscordGatewayState {
    fn default() -> Self {
        Self {
            session_id: Mutex::new(None),
            sequence: AtomicI64::new(-1),
            resume_gateway_url: Mutex::new(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// A fresh session. Events sent while disconnected are lost.
    Ready {
        session_id: String,
        resume_gateway_url: String,
        user_id: String,
        /// Guilds the bot already belongs to.
        guild_ids: Vec<String>,
    },
    /// Sent for every guild after READY, and again when the bot joins one.
    GuildCreate {
        guild_id: String,
        name: String,
        channels: Vec<GuildChannel>,
    },
    MessageCreate {
        guild_id: Option<String>,
        channel_id: String,
        message_id: String,
        author_id: String,
        author_is_bot: bool,
        timestamp: Option<String>,
        pinned: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildChannel {
    pub id: String,
    pub name: String,
    /// Discord channel type; 0 is a text channel, 5 an announcement channel.
    pub kind: u64,
    pub position: i64,
}

pub struct DiscordGateway {
    bot_token: String,
    intents: u64,
    state: Arc<DiscordGatewayState>,
    presence: Option<serde_json::Value>,
}

impl DiscordGateway {
    pub fn new(
        bot_token: String,
        intents: u64,
        state: Arc<DiscordGatewayState>,
        presence: Option<serde_json::Value>,
    ) -> Self {
        Self {
            bot_token,
            intents,
            state,
            presence,
        }
    }

    /// Run one gateway session. Returns `Ok` when the session should be
    /// re-established (reconnect request, missed ACK, closed socket).
    pub async fn connect_and_listen(
        &self,
        http: &DiscordHttpClient,
        tx: &tokio::sync::mpsc::Sender<GatewayEvent>,
    ) -> Result<()> {
        let gateway_url = self.resolve_gateway_url(http).await?;
        let ws_url = build_gateway_ws_url(&gateway_url);

        let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .with_context(|| format!("connect Discord gateway websocket: {ws_url}"))?;
        let (mut write, mut read) = ws_stream.split();

        let heartbeat_interval_ms = read_hello_heartbeat_interval(&mut read).await?;
        self.send_identify_or_resume(&mut write).await?;

        let mut heartbeat = interval(Duration::from_millis(heartbeat_interval_ms));
        let heartbeat_acked = AtomicBool::new(true);
        let mut ack_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let healthy = self
                        .send_heartbeat_if_healthy(
                            &mut write,
                            &heartbeat_acked,
                            &mut ack_deadline,
                            heartbeat_interval_ms,
                        )
                        .await?;
                    if !healthy {
                        tracing::warn!("Discord gateway heartbeat ACK missing; reconnecting");
                        return Ok(());
                    }
                }
                () = wait_for_ack_timeout(ack_deadline) => {
                    if !heartbeat_acked.load(Ordering::SeqCst) {
                        tracing::warn!("Discord gateway heartbeat ACK timeout; reconnecting");
                        return Ok(());
                    }
                    ack_deadline = None;
                }
                message = read.next() => {
                    let Some(message) = message else {
                        tracing::warn!("Discord gateway socket closed; reconnecting");
                        return Ok(());
                    };

                    let message = message.context("read Discord gateway message")?;
                    let keep_going = self
                        .handle_gateway_message(
                            message,
                            tx,
                            &mut write,
                            &heartbeat_acked,
                            &mut ack_deadline,
                            heartbeat_interval_ms,
                        )
                        .await?;
                    if !keep_going {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn resolve_gateway_url(&self, http: &DiscordHttpClient) -> Result<String> {
        if let Some(url) = self.state.resume_gateway_url.lock().await.clone()
            && !url.is_empty()
        {
            return Ok(url);
        }

        let gw_resp = http
            .get_gateway_bot()
            .await
            .context("fetch Discord gateway/bot URL")?;
        let url = gw_resp
            .get("url")
            .and_then(|u| u.as_str())
            .unwrap_or("wss://gateway.discord.gg")
            .to_string();
        Ok(url)
    }

    async fn send_identify_or_resume<WsSink>(&self, write: &mut WsSink) -> Result<()>
    where
        WsSink: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        if let Some(session_id) = self.state.session_id.lock().await.clone() {
            let payload = json!({
                "op": GatewayOpcode::Resume as u8,
                "d": {
                    "token": self.bot_token,
                    "session_id": session_id,
                    "seq": self.current_sequence_value(),
                }
            });
            write
                .send(Message::Text(payload.to_string().into()))
                .await
                .context("send Discord gateway resume")?;
            return Ok(());
        }

        let payload = build_identify_payload(&self.bot_token, self.intents, self.presence.as_ref());
        write
            .send(Message::Text(payload.to_string().into()))
            .await
            .context("send Discord gateway identify")
    }

    async fn send_heartbeat_if_healthy<WsSink>(
        &self,
        write: &mut WsSink,
        heartbeat_acked: &AtomicBool,
        ack_deadline: &mut Option<Instant>,
        heartbeat_interval_ms: u64,
    ) -> Result<bool>
    where
        WsSink: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        if !heartbeat_acked.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let payload = json!({
            "op": GatewayOpcode::Heartbeat as u8,
            "d": self.current_sequence(),
        });

        write
            .send(Message::Text(payload.to_string().into()))
            .await
            .context("send Discord gateway heartbeat")?;

        heartbeat_acked.store(false, Ordering::SeqCst);
        *ack_deadline = Some(Instant::now() + Duration::from_millis(heartbeat_interval_ms));
        Ok(true)
    }

    async fn handle_gateway_message<WsSink>(
        &self,
        message: Message,
        tx: &tokio::sync::mpsc::Sender<GatewayEvent>,
        write: &mut WsSink,
        heartbeat_acked: &AtomicBool,
        ack_deadline: &mut Option<Instant>,
        heartbeat_interval_ms: u64,
    ) -> Result<bool>
    where
        WsSink: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let Some(raw) = websocket_message_to_text(message) else {
            return Ok(true);
        };

        let payload: serde_json::Value =
            serde_json::from_str(&raw).context("parse Discord gateway payload")?;

        if let Some(sequence) = payload.get("s").and_then(serde_json::Value::as_i64) {
            self.state.sequence.store(sequence, Ordering::SeqCst);
        }

        let op = payload
            .get("op")
            .and_then(serde_json::Value::as_u64)
            .and_then(GatewayOpcode::from_u64);

        match op {
            Some(GatewayOpcode::Heartbeat) => {
                self.send_heartbeat_if_healthy(
                    write,
                    heartbeat_acked,
                    ack_deadline,
                    heartbeat_interval_ms,
                )
                .await
            }
            Some(GatewayOpcode::HeartbeatAck) => {
                heartbeat_acked.store(true, Ordering::SeqCst);
                *ack_deadline = None;
                Ok(true)
            }
            Some(GatewayOpcode::Reconnect) => {
                tracing::info!("Discord gateway requested reconnect");
                Ok(false)
            }
            Some(GatewayOpcode::InvalidSession) => {
                self.handle_invalid_session(&payload).await;
                Ok(false)
            }
            Some(GatewayOpcode::Dispatch) => {
                self.handle_dispatch_payload(&payload, tx).await?;
                Ok(true)
            }
            _ => Ok(true),
        }
    }

    async fn handle_dispatch_payload(
        &self,
        payload: &serde_json::Value,
        tx: &tokio::sync::mpsc::Sender<GatewayEvent>,
    ) -> Result<()> {
        let event_type = payload
            .get("t")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("");
        let Some(data) = payload.get("d") else {
            return Ok(());
        };

        if let Some(event) = parse_dispatch_event(event_type, data) {
            if let GatewayEvent::Ready {
                session_id,
                resume_gateway_url,
                ..
            } = &event
            {
                *self.state.session_id.lock().await = Some(session_id.clone());
                *self.state.resume_gateway_url.lock().await = Some(resume_gateway_url.clone());
            }
            tx.send(event)
                .await
                .context("dispatch parsed Discord gateway event")?;
        }

        Ok(())
    }

    async fn handle_invalid_session(&self, payload: &serde_json::Value) {
        let can_resume = payload
            .get("d")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        self.state.sequence.store(-1, Ordering::SeqCst);
        *self.state.session_id.lock().await = None;

        if can_resume {
            let wait_secs = invalid_session_backoff_secs();
            tracing::warn!(wait_secs, "Discord gateway invalid session (resume allowed)");
            tokio::time::sleep(Duration::from_secs(wait_secs)).await;
            return;
        }

        tracing::warn!("Discord gateway invalid session (resume denied), clearing resume URL");
        *self.state.resume_gateway_url.lock().await = None;
    }

    fn current_sequence(&self) -> serde_json::Value {
        let sequence = self.current_sequence_value();
        if sequence < 0 {
            serde_json::Value::Null
        } else {
            json!(sequence)
        }
    }

    fn current_sequence_value(&self) -> i64 {
        self.state.sequence.load(Ordering::SeqCst)
    }
}

fn build_identify_payload(
    bot_token: &str,
    intents: u64,
    presence: Option<&serde_json::Value>,
) -> serde_json::Value {
    let mut identify_data = json!({
        "token": bot_token,
        "intents": intents,
        "properties": {
            "os": std::env::consts::OS,
            "browser": "servermaid",
            "device": "servermaid"
        }
    });

    if let Some(presence) = presence {
        identify_data["presence"] = presence.clone();
    }

    json!({
        "op": GatewayOpcode::Identify as u8,
        "d": identify_data,
    })
}

pub fn parse_dispatch_event(event_type: &str, d: &serde_json::Value) -> Option<GatewayEvent> {
    match event_type {
        "READY" => parse_ready_event(d),
        "MESSAGE_CREATE" => parse_message_create_event(d),
        "GUILD_CREATE" => parse_guild_create_event(d),
        "RESUMED" => {
            tracing::info!("Discord gateway session resumed");
            None
        }
        _ => None,
    }
}

fn parse_ready_event(d: &serde_json::Value) -> Option<GatewayEvent> {
    let session_id = d.get("session_id")?.as_str()?.to_string();
    let resume_gateway_url = d.get("resume_gateway_url")?.as_str()?.to_string();
    let user_id = d.get("user")?.get("id")?.as_str()?.to_string();
    let guild_ids = d
        .get("guilds")
        .and_then(serde_json::Value::as_array)
        .map(|guilds| {
            guilds
                .iter()
                .filter_map(|guild| guild.get("id")?.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Some(GatewayEvent::Ready {
        session_id,
        resume_gateway_url,
        user_id,
        guild_ids,
    })
}

fn parse_guild_create_event(d: &serde_json::Value) -> Option<GatewayEvent> {
    let guild_id = d.get("id")?.as_str()?.to_string();
    let name = d
        .get("name")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    let channels = d
        .get("channels")
        .and_then(serde_json::Value::as_array)
        .map(|channels| channels.iter().filter_map(parse_guild_channel).collect())
        .unwrap_or_default();

    Some(GatewayEvent::GuildCreate {
        guild_id,
        name,
        channels,
    })
}

fn parse_guild_channel(c: &serde_json::Value) -> Option<GuildChannel> {
    Some(GuildChannel {
        id: c.get("id")?.as_str()?.to_string(),
        name: c
            .get("name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string(),
        kind: c.get("type")?.as_u64()?,
        position: c
            .get("position")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or_default(),
    })
}

fn parse_message_create_event(d: &serde_json::Value) -> Option<GatewayEvent> {
    let channel_id = d.get("channel_id")?.as_str()?.to_string();
    let message_id = d.get("id")?.as_str()?.to_string();
    let author = d.get("author")?;
    let author_id = author.get("id")?.as_str()?.to_string();
    let author_is_bot = author
        .get("bot")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    let guild_id = d
        .get("guild_id")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);
    let timestamp = d
        .get("timestamp")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);
    let pinned = d
        .get("pinned")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    Some(GatewayEvent::MessageCreate {
        guild_id,
        channel_id,
        message_id,
        author_id,
        author_is_bot,
        timestamp,
        pinned,
    })
}

async fn wait_for_ack_timeout(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    } else {
        futures_util::future::pending::<()>().await;
    }
}

async fn read_hello_heartbeat_interval<WsRead>(read: &mut WsRead) -> Result<u64>
where
    WsRead:
        Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = read.next().await {
        let message = message.context("read Discord gateway hello payload")?;
        let Some(raw) = websocket_message_to_text(message) else {
            continue;
        };

        let payload: serde_json::Value =
            serde_json::from_str(&raw).context("parse Discord gateway hello JSON")?;

        let op = payload
            .get("op")
            .and_then(serde_json::Value::as_u64)
            .and_then(GatewayOpcode::from_u64);

        if op == Some(GatewayOpcode::Hello) {
            let interval_ms = payload
                .get("d")
                .and_then(|d| d.get("heartbeat_interval"))
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);
            return Ok(interval_ms);
        }
    }

    Err(anyhow::anyhow!("Discord gateway closed before Hello"))
}

fn websocket_message_to_text(message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text.to_string()),
        Message::Binary(bytes) => String::from_utf8(bytes.to_vec()).ok(),
        _ => None,
    }
}

fn build_gateway_ws_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    format!("{trimmed}/?v=10&encoding=json")
}

fn invalid_session_backoff_secs() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.subsec_nanos())
        .unwrap_or(0);
    1 + u64::from(nanos % 5)
}
