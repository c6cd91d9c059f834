use arrayvec::ArrayString;
use std::fmt;
use std::str::FromStr;

/// Hex-encoded SHA-256 of a plugin credential - exactly 64 characters, stored inline.
pub type TokenHash = ArrayString<64>;

/// Last-known liveness of a link's session.
///
/// Derived, not authoritative: the Session Registry is the source of truth
/// for whether a session is live right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
  Connected,
  Disconnected,
  Error,
}

impl LinkStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      LinkStatus::Connected => "connected",
      LinkStatus::Disconnected => "disconnected",
      LinkStatus::Error => "error",
    }
  }
}

impl fmt::Display for LinkStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for LinkStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "connected" => Ok(LinkStatus::Connected),
      "disconnected" => Ok(LinkStatus::Disconnected),
      "error" => Ok(LinkStatus::Error),
      other => Err(format!("unknown link status '{other}'")),
    }
  }
}

/// Opaque reference to a channel's outbound delivery target (a webhook URL).
///
/// The URL embeds the webhook secret, so `Debug` never prints it.
#[derive(Clone, PartialEq, Eq)]
pub struct DeliveryEndpoint(String);

impl DeliveryEndpoint {
  pub fn new(url: impl Into<String>) -> Self {
    Self(url.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Debug for DeliveryEndpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("DeliveryEndpoint(<redacted>)")
  }
}

/// A binding between one Discord channel and one game-server credential.
#[derive(Debug, Clone)]
pub struct Link {
  /// Discord guild ID
  pub guild_id: u64,
  /// Discord channel ID (unique across the store)
  pub channel_id: u64,
  /// SHA-256 hash of the plugin credential (unique across the store)
  pub token_hash: TokenHash,
  /// Display name the game server announced at auth, if any
  pub server_name: Option<String>,
  /// Cached webhook for this channel, created lazily
  pub delivery_endpoint: Option<DeliveryEndpoint>,
  pub status: LinkStatus,
  /// Unix timestamp when the link was created
  pub created_at: i64,
  /// Unix timestamp of the last status change, if any
  pub last_seen_at: Option<i64>,
}

impl Link {
  /// First 12 hex chars of the token hash, safe for logs and chat.
  pub fn short_hash(&self) -> &str {
    &self.token_hash[..12]
  }

  /// Server display name, falling back to "Minecraft".
  pub fn display_name(&self) -> &str {
    self.server_name.as_deref().unwrap_or("Minecraft")
  }
}

/// Result of binding a credential to a channel.
#[derive(Debug, Clone)]
pub enum LinkUpsert {
  /// No link existed for the channel.
  Created(Link),
  /// The channel was already bound to this credential.
  Unchanged(Link),
  /// The channel was bound to a different, disconnected credential which was replaced.
  Rekeyed(Link),
}

impl LinkUpsert {
  pub fn link(&self) -> &Link {
    match self {
      LinkUpsert::Created(link) | LinkUpsert::Unchanged(link) | LinkUpsert::Rekeyed(link) => link,
    }
  }

  pub fn into_link(self) -> Link {
    match self {
      LinkUpsert::Created(link) | LinkUpsert::Unchanged(link) | LinkUpsert::Rekeyed(link) => link,
    }
  }
}

/// Row returned for per-guild listings (no secrets).
#[derive(Debug, Clone)]
pub struct LinkSummary {
  pub channel_id: u64,
  pub token_hash: TokenHash,
  pub server_name: Option<String>,
  pub status: LinkStatus,
  pub last_seen_at: Option<i64>,
}
