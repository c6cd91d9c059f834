mod error;
mod models;

pub use error::{DbError, Result};
pub use models::{DeliveryEndpoint, Link, LinkStatus, LinkSummary, LinkUpsert, TokenHash};

use std::path::Path;
use tokio_rusqlite::Connection;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, Row, params, types::Type};
use tracing::{debug, info};

const SELECT_LINK: &str = "SELECT guild_id, channel_id, token_hash, server_name, webhook_url, status, created_at, last_seen_at FROM links";

/// Database wrapper for the link store.
#[derive(Clone)]
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create a database at the given path.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = Connection::open(path).await.map_err(DbError::Sqlite)?;
    let db = Self { conn };
    db.initialize().await?;
    Ok(db)
  }

  /// Create an in-memory database (useful for testing).
  pub async fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .await
      .map_err(DbError::Sqlite)?;
    let db = Self { conn };
    db.initialize().await?;
    Ok(db)
  }

  /// Initialize the database schema.
  async fn initialize(&self) -> Result<()> {
    self.conn
            .call(|conn| {
                // WAL keeps status writes from blocking link lookups
                conn.pragma_update(None, "journal_mode", "WAL")?;

                conn.execute_batch(
                    r#"
                    -- One row per bound channel. Raw tokens are never stored.
                    CREATE TABLE IF NOT EXISTS links (
                        guild_id INTEGER NOT NULL,
                        channel_id INTEGER NOT NULL UNIQUE,
                        token_hash TEXT NOT NULL UNIQUE,
                        server_name TEXT,
                        webhook_url TEXT,
                        status TEXT NOT NULL DEFAULT 'disconnected',
                        created_at INTEGER NOT NULL,
                        last_seen_at INTEGER,
                        -- id of the session that last authenticated; never reused
                        -- within a process lifetime
                        session_id INTEGER,
                        PRIMARY KEY (guild_id, channel_id)
                    );

                    CREATE INDEX IF NOT EXISTS idx_links_guild ON links(guild_id);
                    "#,
                )?;
                Ok(())
            })
            .await?;

    info!("database initialized");
    Ok(())
  }

  // ========================================================================
  // Links
  // ========================================================================

  /// Bind a credential hash to a channel.
  ///
  /// Fails with `TokenAlreadyLinked` if the hash belongs to another channel and
  /// with `ChannelAlreadyLinked` if the channel is bound to a different hash
  /// whose server is currently connected.
  pub async fn upsert_link(
    &self,
    guild_id: u64,
    channel_id: u64,
    token_hash: TokenHash,
    now: i64,
  ) -> Result<LinkUpsert> {
    let result = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let owner: Option<u64> = tx
                    .prepare_cached("SELECT channel_id FROM links WHERE token_hash = ?1")?
                    .query_row(params![token_hash.as_str()], |row| row.get(0))
                    .optional()?;

                if owner.is_some_and(|owner| owner != channel_id) {
                    return Ok(Err(DbError::TokenAlreadyLinked));
                }

                let existing: Option<Link> = tx
                    .prepare_cached(&format!("{SELECT_LINK} WHERE channel_id = ?1"))?
                    .query_row(params![channel_id], link_from_row)
                    .optional()?;

                let outcome = match existing {
                    Some(link) if link.token_hash == token_hash => LinkUpsert::Unchanged(link),
                    Some(link) if link.status == LinkStatus::Connected => {
                        return Ok(Err(DbError::ChannelAlreadyLinked));
                    }
                    Some(mut link) => {
                        tx.prepare_cached(
                            "UPDATE links SET token_hash = ?1, server_name = NULL, status = 'disconnected', session_id = NULL WHERE channel_id = ?2",
                        )?
                            .execute(params![token_hash.as_str(), channel_id])?;
                        link.token_hash = token_hash;
                        link.server_name = None;
                        link.status = LinkStatus::Disconnected;
                        LinkUpsert::Rekeyed(link)
                    }
                    None => {
                        tx.prepare_cached(
                            "INSERT INTO links (guild_id, channel_id, token_hash, status, created_at) VALUES (?1, ?2, ?3, 'disconnected', ?4)",
                        )?
                            .execute(params![guild_id, channel_id, token_hash.as_str(), now])?;
                        LinkUpsert::Created(Link {
                            guild_id,
                            channel_id,
                            token_hash,
                            server_name: None,
                            delivery_endpoint: None,
                            status: LinkStatus::Disconnected,
                            created_at: now,
                            last_seen_at: None,
                        })
                    }
                };

                tx.commit()?;
                Ok(Ok(outcome))
            })
            .await??;

    debug!(
      guild_id,
      channel_id,
      short_hash = result.link().short_hash(),
      "upserted link"
    );
    Ok(result)
  }

  /// Get the link bound to a channel.
  pub async fn get_link_by_channel(&self, channel_id: u64) -> Result<Option<Link>> {
    let link = self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(&format!("{SELECT_LINK} WHERE channel_id = ?1"))?
          .query_row(params![channel_id], link_from_row)
          .optional()
      })
      .await?;

    Ok(link)
  }

  /// Get the link a credential hash authenticates as.
  pub async fn get_link_by_token_hash(&self, token_hash: TokenHash) -> Result<Option<Link>> {
    let link = self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(&format!("{SELECT_LINK} WHERE token_hash = ?1"))?
          .query_row(params![token_hash.as_str()], link_from_row)
          .optional()
      })
      .await?;

    Ok(link)
  }

  /// List all links for a guild, ordered by channel.
  pub async fn get_links_by_guild(&self, guild_id: u64) -> Result<Vec<LinkSummary>> {
    let links = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&format!(
          "{SELECT_LINK} WHERE guild_id = ?1 ORDER BY channel_id"
        ))?;

        let links = stmt
          .query_map(params![guild_id], link_from_row)?
          .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(links)
      })
      .await?;

    Ok(
      links
        .into_iter()
        .map(|link| LinkSummary {
          channel_id: link.channel_id,
          token_hash: link.token_hash,
          server_name: link.server_name,
          status: link.status,
          last_seen_at: link.last_seen_at,
        })
        .collect(),
    )
  }

  /// Remove the link for a channel, returning it if one existed.
  /// Removing a missing link is a no-op.
  pub async fn delete_link(&self, guild_id: u64, channel_id: u64) -> Result<Option<Link>> {
    let removed = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let link = tx
          .prepare_cached(&format!(
            "{SELECT_LINK} WHERE guild_id = ?1 AND channel_id = ?2"
          ))?
          .query_row(params![guild_id, channel_id], link_from_row)
          .optional()?;

        if link.is_some() {
          tx.prepare_cached("DELETE FROM links WHERE guild_id = ?1 AND channel_id = ?2")?
            .execute(params![guild_id, channel_id])?;
        }

        tx.commit()?;
        Ok(link)
      })
      .await?;

    debug!(guild_id, channel_id, existed = removed.is_some(), "deleted link");
    Ok(removed)
  }

  /// Record a successful authentication by `session_id`: status becomes
  /// connected and the announced server name (if any) is stored.
  ///
  /// Returns false, changing nothing, if the link is gone, is now bound to a
  /// different credential, or a newer session has already authenticated.
  pub async fn record_auth(
    &self,
    channel_id: u64,
    token_hash: TokenHash,
    session_id: u64,
    server_name: Option<String>,
    now: i64,
  ) -> Result<bool> {
    let updated = self
      .conn
      .call(move |conn| {
        let updated = conn
          .prepare_cached(
            "UPDATE links SET status = 'connected', server_name = COALESCE(?1, server_name), last_seen_at = ?2, session_id = ?3 \
             WHERE channel_id = ?4 AND token_hash = ?5 AND (session_id IS NULL OR session_id < ?3)",
          )?
          .execute(params![server_name, now, session_id, channel_id, token_hash.as_str()])?;
        Ok(updated > 0)
      })
      .await?;

    debug!(channel_id, session_id, updated, "recorded authentication");
    Ok(updated)
  }

  /// Mark a link down on behalf of the session that holds it. A no-op
  /// returning false when another session has authenticated since.
  pub async fn release_session(
    &self,
    channel_id: u64,
    session_id: u64,
    status: LinkStatus,
    now: i64,
  ) -> Result<bool> {
    let updated = self
      .conn
      .call(move |conn| {
        let updated = conn
          .prepare_cached(
            "UPDATE links SET status = ?1, last_seen_at = ?2 WHERE channel_id = ?3 AND session_id = ?4",
          )?
          .execute(params![status.as_str(), now, channel_id, session_id])?;
        Ok(updated > 0)
      })
      .await?;

    debug!(channel_id, session_id, %status, updated, "released session");
    Ok(updated)
  }

  /// Cache (or clear) the delivery endpoint for a channel.
  pub async fn set_delivery_endpoint(
    &self,
    channel_id: u64,
    endpoint: Option<DeliveryEndpoint>,
  ) -> Result<bool> {
    let updated = self
      .conn
      .call(move |conn| {
        let url = endpoint.as_ref().map(|e| e.as_str().to_string());
        let updated = conn
          .prepare_cached("UPDATE links SET webhook_url = ?1 WHERE channel_id = ?2")?
          .execute(params![url, channel_id])?;
        Ok(updated > 0)
      })
      .await?;

    Ok(updated)
  }

  /// Mark every connected link as disconnected. Called at startup, since
  /// sessions never survive a restart.
  pub async fn mark_all_disconnected(&self, now: i64) -> Result<u64> {
    let updated = self
      .conn
      .call(move |conn| {
        let updated = conn
          .prepare_cached(
            "UPDATE links SET status = 'disconnected', last_seen_at = ?1 WHERE status = 'connected'",
          )?
          .execute(params![now])?;
        // session ids restart with the process
        conn
          .prepare_cached("UPDATE links SET session_id = NULL")?
          .execute([])?;
        Ok(updated as u64)
      })
      .await?;

    if updated > 0 {
      info!(updated, "reset stale connected links");
    }
    Ok(updated)
  }
}

/// Parse a hex digest into a `TokenHash`.
pub fn token_hash_from_hex(hex: &str) -> Result<TokenHash> {
  if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
    return Err(DbError::InvalidTokenHash);
  }
  TokenHash::from(&hex.to_ascii_lowercase()).map_err(|_| DbError::InvalidTokenHash)
}

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<Link> {
  let token_hash: String = row.get(2)?;
  let webhook_url: Option<String> = row.get(4)?;
  let status: String = row.get(5)?;

  Ok(Link {
    guild_id: row.get(0)?,
    channel_id: row.get(1)?,
    token_hash: token_hash_from_hex(&token_hash)
      .map_err(|e| conversion_error(2, e.to_string()))?,
    server_name: row.get(3)?,
    delivery_endpoint: webhook_url.map(DeliveryEndpoint::new),
    status: status.parse().map_err(|e| conversion_error(5, e))?,
    created_at: row.get(6)?,
    last_seen_at: row.get(7)?,
  })
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
  rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}
