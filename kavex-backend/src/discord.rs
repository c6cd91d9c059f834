//! Serenity-backed Discord plumbing: the real webhook client, and the
//! adapter from gateway messages to [`ChannelMessage`].
//!
//! Rate limits are mostly absorbed by serenity's own ratelimiter, which
//! tracks the per-route buckets and sleeps through 429s before retrying. A
//! 429 that still surfaces here carries no retry-after that serenity
//! exposes, so it maps to [`PostError::RateLimited`] without a hint and
//! delivery falls back to its configured cool-down.

use crate::delivery::{PostError, Presentation, WebhookApi};
use crate::formatting::RoleInfo;
use crate::outbound::ChannelMessage;
use async_trait::async_trait;
use kavex_db::DeliveryEndpoint;
use serde_json::{Map, Value, json};
use serenity::all::{
    ChannelId, Context, CreateWebhook, Error as SerenityError, Http, Message, WebhookId,
};
use std::sync::Arc;

/// Webhooks over serenity's HTTP client.
pub struct SerenityWebhooks {
    http: Arc<Http>,
}

impl SerenityWebhooks {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl WebhookApi for SerenityWebhooks {
    async fn create(&self, channel_id: u64, name: &str) -> Result<DeliveryEndpoint, PostError> {
        let webhook = ChannelId::new(channel_id)
            .create_webhook(&self.http, CreateWebhook::new(name))
            .await
            .map_err(classify)?;
        let url = webhook.url().map_err(classify)?;
        Ok(DeliveryEndpoint::new(url))
    }

    async fn execute(
        &self,
        endpoint: &DeliveryEndpoint,
        presentation: &Presentation,
    ) -> Result<(), PostError> {
        let (id, token) = parse_webhook_url(endpoint.as_str()).ok_or(PostError::TargetMissing)?;
        let body = webhook_body(presentation);
        self.http
            .execute_webhook(WebhookId::new(id), None, token, false, vec![], &body)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

/// JSON body for an execute call. Mentions are never parsed.
fn webhook_body(presentation: &Presentation) -> Value {
    let mut body = Map::new();
    body.insert("content".to_string(), json!(presentation.content));
    body.insert("username".to_string(), json!(presentation.username));
    if let Some(avatar) = &presentation.avatar_url {
        body.insert("avatar_url".to_string(), json!(avatar));
    }
    body.insert("allowed_mentions".to_string(), json!({ "parse": [] }));
    Value::Object(body)
}

/// Split `.../webhooks/{id}/{token}` into its parts.
fn parse_webhook_url(url: &str) -> Option<(u64, &str)> {
    let rest = url.split_once("/webhooks/")?.1;
    let (id, token) = rest.split_once('/')?;
    let token = token.split(['?', '/']).next()?;
    let id: u64 = id.parse().ok()?;
    if id == 0 || token.is_empty() {
        return None;
    }
    Some((id, token))
}

fn classify(err: SerenityError) -> PostError {
    match &err {
        SerenityError::Http(http) => match http.status_code().map(|s| s.as_u16()) {
            Some(404) => PostError::TargetMissing,
            // serenity's error response drops the retry-after body field
            Some(429) => PostError::RateLimited { retry_after: None },
            Some(401) | Some(403) => PostError::Forbidden,
            _ => PostError::Transient(err.to_string()),
        },
        _ => PostError::Transient(err.to_string()),
    }
}

/// Reduce a gateway message to what the outbound router needs. `None` for
/// direct messages.
pub fn channel_message(ctx: &Context, msg: &Message) -> Option<ChannelMessage> {
    let guild_id = msg.guild_id?;

    let author_name = msg
        .member
        .as_ref()
        .and_then(|m| m.nick.clone())
        .or_else(|| msg.author.global_name.clone())
        .unwrap_or_else(|| msg.author.name.clone());

    let mut roles = Vec::new();
    let mut role_mentions = Vec::new();
    if let Some(guild) = ctx.cache.guild(guild_id) {
        if let Some(member) = &msg.member {
            roles = member
                .roles
                .iter()
                .filter_map(|id| guild.roles.get(id))
                .map(|role| RoleInfo {
                    name: role.name.clone(),
                    position: role.position,
                    color: role.colour.0,
                    hoist: role.hoist,
                })
                .collect();
        }
        role_mentions = msg
            .mention_roles
            .iter()
            .filter_map(|id| guild.roles.get(id).map(|r| (id.get(), r.name.clone())))
            .collect();
    }

    let mentions = msg
        .mentions
        .iter()
        .map(|user| {
            let name = user.global_name.clone().unwrap_or_else(|| user.name.clone());
            (user.id.get(), name)
        })
        .collect();

    Some(ChannelMessage {
        channel_id: msg.channel_id.get(),
        author_name,
        author_is_bot: msg.author.bot,
        webhook_id: msg.webhook_id.map(|id| id.get()),
        content: msg.content.clone(),
        mentions,
        role_mentions,
        roles,
    })
}
