/// Field validation for protocol envelopes and administrative input
use thiserror::Error;

/// Longest chat body or death message accepted from a game server
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Longest raw token accepted by `connect`
pub const MAX_TOKEN_LEN: usize = 256;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Player name cannot be empty")]
    PlayerNameEmpty,

    #[error("Player name too long (max 16 characters, got {0})")]
    PlayerNameTooLong(usize),

    #[error("Player name contains invalid characters (only alphanumeric and underscore allowed)")]
    PlayerNameInvalidChars,

    #[error("Display name must be 1-80 characters without control characters")]
    DisplayNameInvalid,

    #[error("Color must be in #RRGGBB form")]
    ColorInvalidFormat,

    #[error("Player UUID has invalid format")]
    UuidInvalidFormat,

    #[error("Message cannot be empty")]
    MessageEmpty,

    #[error("Message too long (max {max} characters, got {actual})")]
    MessageTooLong { max: usize, actual: usize },

    #[error("Token cannot be empty")]
    TokenEmpty,

    #[error("Token too long (max 256 characters)")]
    TokenTooLong,

    #[error("Token contains whitespace or non-printable characters")]
    TokenInvalidChars,

    #[error("Server name too long (max 64 characters, got {0})")]
    ServerNameTooLong(usize),
}

/// Validates a Minecraft player name
///
/// Rules:
/// - Cannot be empty
/// - Max 16 characters (Minecraft username limit)
/// - Only ASCII alphanumeric characters and underscores, with one optional
///   leading '.' (Bedrock players behind a proxy)
pub fn validate_player_name(name: &str) -> Result<(), ValidationError> {
    let bare = name.strip_prefix('.').unwrap_or(name);

    if bare.is_empty() {
        return Err(ValidationError::PlayerNameEmpty);
    }

    if name.len() > 16 {
        return Err(ValidationError::PlayerNameTooLong(name.len()));
    }

    if !bare.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ValidationError::PlayerNameInvalidChars);
    }

    Ok(())
}

/// Validates a chat display name (game player, console, or Discord member)
pub fn validate_display_name(name: &str) -> Result<(), ValidationError> {
    let len = name.chars().count();
    if name.trim().is_empty() || len > 80 || name.chars().any(char::is_control) {
        return Err(ValidationError::DisplayNameInvalid);
    }
    Ok(())
}

/// Validates a `#RRGGBB` color
pub fn validate_color(color: &str) -> Result<(), ValidationError> {
    match color.strip_prefix('#') {
        Some(hex) if hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()) => Ok(()),
        _ => Err(ValidationError::ColorInvalidFormat),
    }
}

/// Validates a player UUID: 32 hex digits, optionally in the dashed 8-4-4-4-12 form
pub fn validate_uuid(uuid: &str) -> Result<(), ValidationError> {
    let valid = match uuid.len() {
        32 => uuid.chars().all(|c| c.is_ascii_hexdigit()),
        36 => uuid.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        }),
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(ValidationError::UuidInvalidFormat)
    }
}

/// Validates a chat body or death message
pub fn validate_message(message: &str) -> Result<(), ValidationError> {
    if message.trim().is_empty() {
        return Err(ValidationError::MessageEmpty);
    }

    let len = message.chars().count();
    if len > MAX_MESSAGE_LEN {
        return Err(ValidationError::MessageTooLong {
            max: MAX_MESSAGE_LEN,
            actual: len,
        });
    }

    Ok(())
}

/// Validates a raw plugin token (after trimming)
pub fn validate_token(token: &str) -> Result<(), ValidationError> {
    let token = token.trim();

    if token.is_empty() {
        return Err(ValidationError::TokenEmpty);
    }

    if token.len() > MAX_TOKEN_LEN {
        return Err(ValidationError::TokenTooLong);
    }

    if !token.chars().all(|c| c.is_ascii_graphic()) {
        return Err(ValidationError::TokenInvalidChars);
    }

    Ok(())
}

/// Validates the server display name announced at auth
pub fn validate_server_name(name: &str) -> Result<(), ValidationError> {
    let len = name.chars().count();
    if len > 64 {
        return Err(ValidationError::ServerNameTooLong(len));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Player name validation tests
    #[test]
    fn test_valid_player_names() {
        assert!(validate_player_name("Steve").is_ok());
        assert!(validate_player_name("Notch").is_ok());
        assert!(validate_player_name("Player_123").is_ok());
        assert!(validate_player_name("a").is_ok());
        assert!(validate_player_name("1234567890123456").is_ok()); // exactly 16 chars
        assert!(validate_player_name(".BedrockGuy").is_ok());
    }

    #[test]
    fn test_empty_player_name() {
        assert_eq!(
            validate_player_name(""),
            Err(ValidationError::PlayerNameEmpty)
        );
        assert_eq!(
            validate_player_name("."),
            Err(ValidationError::PlayerNameEmpty)
        );
    }

    #[test]
    fn test_player_name_too_long() {
        let long_name = "12345678901234567"; // 17 characters
        assert_eq!(
            validate_player_name(long_name),
            Err(ValidationError::PlayerNameTooLong(17))
        );
    }

    #[test]
    fn test_player_name_invalid_chars() {
        assert_eq!(
            validate_player_name("Player-123"),
            Err(ValidationError::PlayerNameInvalidChars)
        );
        assert_eq!(
            validate_player_name("Player 123"),
            Err(ValidationError::PlayerNameInvalidChars)
        );
        assert_eq!(
            validate_player_name("a.b"),
            Err(ValidationError::PlayerNameInvalidChars)
        );
    }

    #[test]
    fn test_display_names() {
        assert!(validate_display_name("Notch").is_ok());
        assert!(validate_display_name("Cool Guy 🎉").is_ok());
        assert_eq!(
            validate_display_name(" "),
            Err(ValidationError::DisplayNameInvalid)
        );
        assert_eq!(
            validate_display_name("line\nbreak"),
            Err(ValidationError::DisplayNameInvalid)
        );
        assert_eq!(
            validate_display_name(&"a".repeat(81)),
            Err(ValidationError::DisplayNameInvalid)
        );
    }

    #[test]
    fn test_colors() {
        assert!(validate_color("#FFAA00").is_ok());
        assert!(validate_color("#ffaa00").is_ok());
        assert_eq!(validate_color("FFAA00"), Err(ValidationError::ColorInvalidFormat));
        assert_eq!(validate_color("#FFAA0"), Err(ValidationError::ColorInvalidFormat));
    }

    #[test]
    fn test_uuid_formats() {
        assert!(validate_uuid("069a79f444e94726a5befca90e38aaf5").is_ok());
        assert!(validate_uuid("069a79f4-44e9-4726-a5be-fca90e38aaf5").is_ok());
        assert_eq!(
            validate_uuid("069a79f4-44e9-4726-a5be"),
            Err(ValidationError::UuidInvalidFormat)
        );
        assert_eq!(
            validate_uuid("069a79f4x44e9-4726-a5be-fca90e38aaf5"),
            Err(ValidationError::UuidInvalidFormat)
        );
        assert_eq!(
            validate_uuid("zzza79f444e94726a5befca90e38aaf5"),
            Err(ValidationError::UuidInvalidFormat)
        );
    }

    #[test]
    fn test_message_rules() {
        assert!(validate_message("hi").is_ok());
        assert_eq!(validate_message("   "), Err(ValidationError::MessageEmpty));
        let long = "x".repeat(MAX_MESSAGE_LEN + 1);
        assert_eq!(
            validate_message(&long),
            Err(ValidationError::MessageTooLong {
                max: MAX_MESSAGE_LEN,
                actual: MAX_MESSAGE_LEN + 1
            })
        );
    }

    #[test]
    fn test_token_rules() {
        assert!(validate_token("0123abcdef").is_ok());
        assert!(validate_token("  0123abcdef\n").is_ok());
        assert_eq!(validate_token(""), Err(ValidationError::TokenEmpty));
        assert_eq!(validate_token("   "), Err(ValidationError::TokenEmpty));
        assert_eq!(
            validate_token("abc def"),
            Err(ValidationError::TokenInvalidChars)
        );
        assert_eq!(
            validate_token(&"a".repeat(MAX_TOKEN_LEN + 1)),
            Err(ValidationError::TokenTooLong)
        );
    }

    #[test]
    fn test_server_name_too_long() {
        assert!(validate_server_name("Survival SMP").is_ok());
        assert_eq!(
            validate_server_name(&"a".repeat(65)),
            Err(ValidationError::ServerNameTooLong(65))
        );
    }
}
