//! Wire protocol between game-server plugins and the bridge.
//!
//! One JSON object per socket message, discriminated by a `type` field. The
//! codec checks shape only (known type, required fields, field formats);
//! protocol state ("auth before anything else") is enforced by the bridge.

use crate::validation::{self, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A raw plugin credential. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawToken(String);

impl RawToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The secret itself. Only hash it; never log it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RawToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RawToken(<redacted>)")
    }
}

/// The fixed set of envelope types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Auth,
    AuthAck,
    Chat,
    Join,
    Quit,
    Death,
    Heartbeat,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Auth => "auth",
            MessageType::AuthAck => "auth_ack",
            MessageType::Chat => "chat",
            MessageType::Join => "join",
            MessageType::Quit => "quit",
            MessageType::Death => "death",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "auth" => MessageType::Auth,
            "auth_ack" => MessageType::AuthAck,
            "chat" => MessageType::Chat,
            "join" => MessageType::Join,
            "quit" => MessageType::Quit,
            "death" => MessageType::Death,
            "heartbeat" => MessageType::Heartbeat,
            "error" => MessageType::Error,
            _ => return Err(()),
        })
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// First frame of every connection.
    Auth {
        token: RawToken,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel_id: Option<u64>,
    },
    AuthAck {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heartbeat_secs: Option<u64>,
    },
    /// Chat line. Game → Discord carries the player's UUID; Discord → game
    /// carries the author's role prefix and color.
    Chat {
        player: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_uuid: Option<String>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
    },
    Join {
        player: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_uuid: Option<String>,
    },
    Quit {
        player: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_uuid: Option<String>,
    },
    Death {
        player: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_uuid: Option<String>,
        death_message: String,
    },
    Heartbeat,
    Error {
        code: String,
        message: String,
    },
}

/// A game-side event the Inbound Router relays into Discord.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameEvent {
    Chat {
        player: String,
        player_uuid: Option<String>,
        message: String,
    },
    Join {
        player: String,
        player_uuid: Option<String>,
    },
    Quit {
        player: String,
        player_uuid: Option<String>,
    },
    Death {
        player: String,
        player_uuid: Option<String>,
        death_message: String,
    },
}

/// A message that failed shape validation.
#[derive(Debug, Error)]
pub enum MalformedMessage {
    #[error("invalid JSON at line {line} column {column}")]
    InvalidJson { line: usize, column: usize },

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("message has no string 'type' field")]
    MissingType,

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("invalid '{kind}' message: {reason}")]
    InvalidShape { kind: MessageType, reason: String },

    #[error("invalid '{kind}' message: {source}")]
    InvalidField {
        kind: MessageType,
        source: ValidationError,
    },
}

impl Envelope {
    pub fn kind(&self) -> MessageType {
        match self {
            Envelope::Auth { .. } => MessageType::Auth,
            Envelope::AuthAck { .. } => MessageType::AuthAck,
            Envelope::Chat { .. } => MessageType::Chat,
            Envelope::Join { .. } => MessageType::Join,
            Envelope::Quit { .. } => MessageType::Quit,
            Envelope::Death { .. } => MessageType::Death,
            Envelope::Heartbeat => MessageType::Heartbeat,
            Envelope::Error { .. } => MessageType::Error,
        }
    }

    /// Parse and shape-check one socket message.
    pub fn parse(bytes: &[u8]) -> Result<Self, MalformedMessage> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| MalformedMessage::InvalidJson {
            line: e.line(),
            column: e.column(),
        })?;

        let object = value.as_object().ok_or(MalformedMessage::NotAnObject)?;
        let kind = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(MalformedMessage::MissingType)?;
        let kind = MessageType::from_str(kind)
            .map_err(|_| MalformedMessage::UnknownType(kind.chars().take(32).collect()))?;

        let envelope: Envelope = serde_json::from_value(value).map_err(|e| {
            // serde messages can quote field values; keep credentials out of them
            let reason = if kind == MessageType::Auth {
                "expected a string 'token' and optional 'server'/'channel_id'".to_string()
            } else {
                e.to_string()
            };
            MalformedMessage::InvalidShape { kind, reason }
        })?;

        envelope
            .validate()
            .map_err(|source| MalformedMessage::InvalidField { kind, source })?;
        Ok(envelope)
    }

    /// Serialize to the JSON wire form. Field order is fixed by the type
    /// definition, so output is deterministic.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Envelope::Auth { token, server, .. } => {
                validation::validate_token(token.expose())?;
                if let Some(server) = server {
                    validation::validate_server_name(server)?;
                }
            }
            Envelope::Chat {
                player,
                player_uuid,
                message,
                color,
                ..
            } => {
                validation::validate_display_name(player)?;
                validate_optional_uuid(player_uuid)?;
                validation::validate_message(message)?;
                if let Some(color) = color {
                    validation::validate_color(color)?;
                }
            }
            Envelope::Join {
                player,
                player_uuid,
            }
            | Envelope::Quit {
                player,
                player_uuid,
            } => {
                validation::validate_player_name(player)?;
                validate_optional_uuid(player_uuid)?;
            }
            Envelope::Death {
                player,
                player_uuid,
                death_message,
            } => {
                validation::validate_player_name(player)?;
                validate_optional_uuid(player_uuid)?;
                validation::validate_message(death_message)?;
            }
            Envelope::AuthAck { .. } | Envelope::Heartbeat | Envelope::Error { .. } => {}
        }
        Ok(())
    }

    /// Split off the envelopes that carry game events. Anything else is
    /// handed back unchanged.
    pub fn into_game_event(self) -> Result<GameEvent, Envelope> {
        match self {
            Envelope::Chat {
                player,
                player_uuid,
                message,
                ..
            } => Ok(GameEvent::Chat {
                player,
                player_uuid,
                message,
            }),
            Envelope::Join {
                player,
                player_uuid,
            } => Ok(GameEvent::Join {
                player,
                player_uuid,
            }),
            Envelope::Quit {
                player,
                player_uuid,
            } => Ok(GameEvent::Quit {
                player,
                player_uuid,
            }),
            Envelope::Death {
                player,
                player_uuid,
                death_message,
            } => Ok(GameEvent::Death {
                player,
                player_uuid,
                death_message,
            }),
            other => Err(other),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Envelope::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

fn validate_optional_uuid(uuid: &Option<String>) -> Result<(), ValidationError> {
    match uuid {
        Some(uuid) => validation::validate_uuid(uuid),
        None => Ok(()),
    }
}
