//! Discord API constants and type definitions.

use chrono::{DateTime, TimeZone, Utc};

/// Discord API base URL (v10).
pub const API_BASE: &str = "https://discord.com/api/v10";

/// `GUILDS` intent: guild create/update, needed for channel metadata.
pub const INTENT_GUILDS: u64 = 1 << 0;

/// `GUILD_MESSAGES` intent: `MESSAGE_CREATE` in guild channels.
pub const INTENT_GUILD_MESSAGES: u64 = 1 << 9;

/// Default Gateway intents bitmask.
///
/// GUILDS (1) | `GUILD_MESSAGES` (512) = 513. Message content is not needed;
/// only ids, timestamps and pin state are read.
pub const DEFAULT_INTENTS: u64 = INTENT_GUILDS | INTENT_GUILD_MESSAGES;

/// Default presence activity shown next to the bot.
pub const DEFAULT_ACTIVITY_NAME: &str = "Crime Scene Cleaner";

/// Default heartbeat interval when server does not provide one (ms).
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 41250;

/// Milliseconds between the Unix epoch and the Discord epoch (2015-01-01).
pub const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

/// Gateway opcodes used in the Discord WebSocket protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GatewayOpcode {
    /// An event was dispatched (server → client).
    Dispatch = 0,
    /// Fired periodically to keep the connection alive.
    Heartbeat = 1,
    /// Starts a new session during the initial handshake.
    Identify = 2,
    /// Update the client's presence.
    PresenceUpdate = 3,
    /// Resume a previous session that was disconnected.
    Resume = 6,
    /// Server is telling the client to reconnect.
    Reconnect = 7,
    /// The session has been invalidated.
    InvalidSession = 9,
    /// Sent immediately after connecting; contains heartbeat interval.
    Hello = 10,
    /// Acknowledges a received heartbeat.
    HeartbeatAck = 11,
}

impl GatewayOpcode {
    /// Convert a raw u64 value to an opcode, if valid.
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            3 => Some(Self::PresenceUpdate),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }
}

/// Creation time embedded in a snowflake id.
pub fn snowflake_timestamp(id: &str) -> Option<DateTime<Utc>> {
    let raw: u64 = id.parse().ok()?;
    let unix_ms = (raw >> 22).checked_add(DISCORD_EPOCH_MS)?;
    Utc.timestamp_millis_opt(i64::try_from(unix_ms).ok()?).single()
}
