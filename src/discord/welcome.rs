//! Greeting posted when the bot is added to a server.

use crate::error::PlatformError;

use super::gateway::GuildChannel;
use super::http_client::DiscordHttpClient;

const TEXT_CHANNEL: u64 = 0;
const ANNOUNCEMENT_CHANNEL: u64 = 5;
const PREFERRED_NAMES: [&str; 3] = ["welcome", "general", "main"];

pub const WELCOME_MESSAGE: &str = "\
👋 **Thanks for adding ServerMaid!**

I help keep your channels clean by automatically managing message history. \
Channels are managed by the bot operator with the `servermaid` command:

`servermaid configure --server <server> --channel <channel> --max-messages <n> [--keep-pinned]`
  • `--max-messages 100 --keep-pinned` keeps 100 messages and preserves pins
  • `--max-messages 50` keeps 50 messages and treats pins like any other message

`servermaid remove --server <server> --channel <channel>` stops managing a channel
`servermaid list --server <server>` lists the managed channels

**Note:** Once configured, I'll automatically maintain the message limit in those channels! \
If a channel has many more messages than the limit, duplicating it and deleting the old one \
is faster than waiting for old messages to be cleaned up.";

/// Text channels to try, best first: names containing a preferred word
/// (in preference order), then the rest, each group by channel position.
pub fn welcome_targets(channels: &[GuildChannel]) -> Vec<&GuildChannel> {
    let mut text: Vec<&GuildChannel> = channels
        .iter()
        .filter(|c| matches!(c.kind, TEXT_CHANNEL | ANNOUNCEMENT_CHANNEL))
        .collect();
    text.sort_by_key(|c| c.position);

    let mut ordered: Vec<&GuildChannel> = Vec::with_capacity(text.len());
    for preferred in PREFERRED_NAMES {
        for &channel in &text {
            if channel.name.to_lowercase().contains(preferred)
                && !ordered.iter().any(|c| c.id == channel.id)
            {
                ordered.push(channel);
            }
        }
    }
    for channel in text {
        if !ordered.iter().any(|c| c.id == channel.id) {
            ordered.push(channel);
        }
    }
    ordered
}

/// Post [`WELCOME_MESSAGE`] in the first channel that accepts it. Returns the
/// channel used.
pub async fn send_welcome(
    http: &DiscordHttpClient,
    guild_name: &str,
    channels: &[GuildChannel],
) -> Option<String> {
    for channel in welcome_targets(channels) {
        match http.send_message(&channel.id, WELCOME_MESSAGE).await {
            Ok(()) => {
                tracing::info!(
                    guild = guild_name,
                    channel = %channel.name,
                    "sent welcome message"
                );
                return Some(channel.id.clone());
            }
            Err(PlatformError::Forbidden(reason)) => {
                tracing::debug!(channel = %channel.name, %reason, "cannot post welcome here");
            }
            Err(err) => {
                tracing::warn!(
                    guild = guild_name,
                    error = %err,
                    "error sending welcome message"
                );
                return None;
            }
        }
    }
    tracing::warn!(guild = guild_name, "no suitable channel for the welcome message");
    None
}
