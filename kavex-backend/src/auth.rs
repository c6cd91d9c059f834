use crate::helpers::{hash_token, short_hash};
use crate::protocol::RawToken;
use kavex_db::{Database, DbError, Link};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AuthError {
  /// Unknown credential, or a credential bound to a different channel.
  #[error("authentication failed")]
  AuthenticationFailure,

  #[error("link store unavailable: {0}")]
  Store(#[from] DbError),
}

/// Verifies plugin credentials against the link store.
///
/// Only the peppered hash of a token ever leaves this type.
#[derive(Clone)]
pub struct TokenAuthenticator {
  db: Database,
  pepper: String,
}

impl TokenAuthenticator {
  pub fn new(db: Database, pepper: impl Into<String>) -> Self {
    Self {
      db,
      pepper: pepper.into(),
    }
  }

  /// Resolve the link a raw token authenticates as.
  ///
  /// When the plugin names a channel, it must be the link's channel.
  pub async fn authenticate(
    &self,
    token: &RawToken,
    channel_id: Option<u64>,
  ) -> Result<Link, AuthError> {
    let hash = hash_token(token.expose(), &self.pepper);

    let Some(link) = self.db.get_link_by_token_hash(hash).await? else {
      debug!(short_hash = short_hash(&hash), "no link for token");
      return Err(AuthError::AuthenticationFailure);
    };

    if let Some(requested) = channel_id.filter(|&c| c != link.channel_id) {
      warn!(
        short_hash = short_hash(&hash),
        requested,
        bound = link.channel_id,
        "token presented for a different channel"
      );
      return Err(AuthError::AuthenticationFailure);
    }

    Ok(link)
  }
}
