use kavex_db::{TokenHash, token_hash_from_hex};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Hash a plugin credential: `sha256(trim(token) + pepper)`, lower-case hex.
pub fn hash_token(token: &str, pepper: &str) -> TokenHash {
  let mut hasher = Sha256::new();
  hasher.update(token.trim().as_bytes());
  hasher.update(pepper.as_bytes());
  let hex = format!("{:x}", hasher.finalize());
  // sha256 always renders as 64 hex chars
  token_hash_from_hex(&hex).unwrap_or_default()
}

/// First 12 chars of a hash, for logs.
pub fn short_hash(hash: &TokenHash) -> &str {
  &hash[..12]
}

pub fn now() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs() as i64)
    .unwrap_or_default()
}

/// Human-readable "time ago" for status replies.
pub fn format_elapsed(seconds: i64) -> String {
  let seconds = seconds.max(0);
  if seconds < 60 {
    format!("{}s", seconds)
  } else if seconds < 3600 {
    format!("{}m", seconds / 60)
  } else if seconds < 86400 {
    format!("{}h", seconds / 3600)
  } else {
    format!("{}d", seconds / 86400)
  }
}
