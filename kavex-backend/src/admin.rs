use crate::delivery::{Delivery, DeliveryError, Presentation};
use crate::formatting;
use crate::helpers::{hash_token, now};
use crate::registry::SessionRegistry;
use crate::validation::{self, ValidationError};
use kavex_db::{Database, DbError, LinkStatus, LinkSummary, LinkUpsert, TokenHash};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub const TEST_MESSAGE: &str =
  "✅ Test message from the Minecraft bridge. If you can read this, delivery to this channel works.";

#[derive(Debug, Error)]
pub enum AdminError {
  #[error("This channel is already linked to a different server that is currently connected")]
  AlreadyLinked,

  #[error("This token is already linked to another channel")]
  TokenInUse,

  #[error("This channel is not linked to a Minecraft server")]
  NotLinked,

  #[error("{0}")]
  InvalidToken(#[from] ValidationError),

  #[error("Delivery failed: {0}")]
  Delivery(#[from] DeliveryError),

  #[error("link store error: {0}")]
  Store(DbError),
}

impl AdminError {
  /// Binding conflicts: surfaced to the caller, never retried.
  pub fn is_link_conflict(&self) -> bool {
    matches!(self, AdminError::AlreadyLinked | AdminError::TokenInUse)
  }
}

impl From<DbError> for AdminError {
  fn from(err: DbError) -> Self {
    match err {
      DbError::ChannelAlreadyLinked => AdminError::AlreadyLinked,
      DbError::TokenAlreadyLinked => AdminError::TokenInUse,
      other => AdminError::Store(other),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
  pub guild_id: u64,
  pub channel_id: u64,
  pub server_name: String,
  pub status: LinkStatus,
  pub last_seen_at: Option<i64>,
  pub session_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashReport {
  pub token_hash: TokenHash,
  /// Whether a supplied candidate token hashes to the stored value.
  pub matches: Option<bool>,
}

/// The administrative operations behind the slash commands.
pub struct Admin {
  db: Database,
  registry: Arc<SessionRegistry>,
  delivery: Arc<Delivery>,
  pepper: String,
}

impl Admin {
  pub fn new(
    db: Database,
    registry: Arc<SessionRegistry>,
    delivery: Arc<Delivery>,
    pepper: impl Into<String>,
  ) -> Self {
    Self {
      db,
      registry,
      delivery,
      pepper: pepper.into(),
    }
  }

  /// Bind `raw_token` to a channel. Idempotent for the same token; rotating
  /// the token of a disconnected link replaces it.
  pub async fn connect(
    &self,
    guild_id: u64,
    channel_id: u64,
    raw_token: &str,
  ) -> Result<LinkUpsert, AdminError> {
    validation::validate_token(raw_token)?;
    let hash = hash_token(raw_token, &self.pepper);

    let outcome = self.db.upsert_link(guild_id, channel_id, hash, now()).await?;

    if let LinkUpsert::Rekeyed(_) = &outcome {
      // the old credential must not keep a live session
      self.registry.evict(channel_id).await;
    }

    info!(
      guild_id,
      channel_id,
      short_hash = outcome.link().short_hash(),
      outcome = match &outcome {
        LinkUpsert::Created(_) => "created",
        LinkUpsert::Unchanged(_) => "unchanged",
        LinkUpsert::Rekeyed(_) => "rekeyed",
      },
      "link connected"
    );
    Ok(outcome)
  }

  /// Remove a link and close its live session. Returns whether a link
  /// existed; repeating it is a no-op.
  pub async fn disconnect(&self, guild_id: u64, channel_id: u64) -> Result<bool, AdminError> {
    let Some(link) = self.db.delete_link(guild_id, channel_id).await? else {
      return Ok(false);
    };

    self.registry.evict(channel_id).await;
    self.delivery.forget(channel_id).await;
    info!(guild_id, channel_id, short_hash = link.short_hash(), "link removed");
    Ok(true)
  }

  pub async fn status(&self, channel_id: u64) -> Result<StatusReport, AdminError> {
    let link = self
      .db
      .get_link_by_channel(channel_id)
      .await?
      .ok_or(AdminError::NotLinked)?;
    let session_active = self.registry.lookup(channel_id).await.is_some();

    Ok(StatusReport {
      guild_id: link.guild_id,
      channel_id: link.channel_id,
      server_name: link.display_name().to_string(),
      status: link.status,
      last_seen_at: link.last_seen_at,
      session_active,
    })
  }

  /// The stored hash, and optionally whether `candidate` produces it.
  pub async fn debug_hash(
    &self,
    channel_id: u64,
    candidate: Option<&str>,
  ) -> Result<HashReport, AdminError> {
    let link = self
      .db
      .get_link_by_channel(channel_id)
      .await?
      .ok_or(AdminError::NotLinked)?;

    let matches = candidate.map(|token| hash_token(token, &self.pepper) == link.token_hash);
    Ok(HashReport {
      token_hash: link.token_hash,
      matches,
    })
  }

  pub async fn debug_links(&self, guild_id: u64) -> Result<Vec<LinkSummary>, AdminError> {
    Ok(self.db.get_links_by_guild(guild_id).await?)
  }

  /// Post a synthetic message through the normal delivery path.
  pub async fn test_send(&self, channel_id: u64) -> Result<(), AdminError> {
    let link = self
      .db
      .get_link_by_channel(channel_id)
      .await?
      .ok_or(AdminError::NotLinked)?;

    let presentation = Presentation {
      username: formatting::webhook_username(link.display_name()),
      avatar_url: None,
      content: TEST_MESSAGE.to_string(),
    };
    self.delivery.deliver(channel_id, &presentation).await?;
    Ok(())
  }
}
