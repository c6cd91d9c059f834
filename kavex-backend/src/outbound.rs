//! Discord → game routing. Best-effort and live-only: a message for a
//! channel with no authenticated session is dropped.

use crate::formatting::{self, RoleInfo};
use crate::protocol::Envelope;
use crate::registry::{SendError, SessionRegistry};
use crate::validation::MAX_MESSAGE_LEN;
use std::sync::Arc;
use tracing::{debug, warn};

/// A Discord channel message, reduced to what relaying needs.
#[derive(Debug, Clone, Default)]
pub struct ChannelMessage {
    pub channel_id: u64,
    pub author_name: String,
    pub author_is_bot: bool,
    /// Set for anything posted through a webhook, including ours.
    pub webhook_id: Option<u64>,
    /// Raw content, with `<@id>` / `<@&id>` mention tokens.
    pub content: String,
    /// Mentioned users as (id, display name).
    pub mentions: Vec<(u64, String)>,
    /// Mentioned roles as (id, name).
    pub role_mentions: Vec<(u64, String)>,
    /// The author's roles, excluding @everyone.
    pub roles: Vec<RoleInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundOutcome {
    Sent,
    /// Bot, webhook, or empty message.
    Ignored,
    /// No live session for the channel.
    NoSession,
    /// The session's queue was full or it was closing.
    Dropped,
}

pub struct OutboundRouter {
    registry: Arc<SessionRegistry>,
}

impl OutboundRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub async fn route(&self, message: &ChannelMessage) -> OutboundOutcome {
        let Some(envelope) = to_envelope(message) else {
            return OutboundOutcome::Ignored;
        };

        let Some(session) = self.registry.lookup(message.channel_id).await else {
            return OutboundOutcome::NoSession;
        };

        let frame = match envelope.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to serialize chat envelope");
                return OutboundOutcome::Dropped;
            }
        };

        match session.send(frame) {
            Ok(()) => OutboundOutcome::Sent,
            Err(reason) => {
                debug!(
                    channel_id = message.channel_id,
                    session_id = session.id(),
                    full = reason == SendError::Full,
                    "dropped chat for game"
                );
                OutboundOutcome::Dropped
            }
        }
    }
}

/// Build the `chat` envelope for a Discord message, or `None` if it should
/// not be relayed.
pub fn to_envelope(message: &ChannelMessage) -> Option<Envelope> {
    if message.author_is_bot || message.webhook_id.is_some() {
        return None;
    }

    let text = render_text(message);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let player = formatting::truncate_chars(message.author_name.trim(), formatting::MAX_USERNAME_LEN);
    let player = if player.is_empty() {
        "Discord".to_string()
    } else {
        player.replace(char::is_control, "")
    };

    let (prefix, color) = formatting::role_style(&message.roles);

    Some(Envelope::Chat {
        player,
        player_uuid: None,
        message: formatting::truncate_chars(text, MAX_MESSAGE_LEN),
        prefix,
        color,
    })
}

/// Markdown to game formatting, then mention tokens to underlined names.
fn render_text(message: &ChannelMessage) -> String {
    let mut text = formatting::discord_markdown_to_minecraft(&message.content);
    for (id, name) in &message.mentions {
        let underlined = formatting::underline_mentions(&format!("@{name}"), [name.as_str()]);
        text = text
            .replace(&format!("<@{id}>"), &underlined)
            .replace(&format!("<@!{id}>"), &underlined);
    }
    for (id, name) in &message.role_mentions {
        let underlined = formatting::underline_mentions(&format!("@{name}"), [name.as_str()]);
        text = text.replace(&format!("<@&{id}>"), &underlined);
    }
    text
}
