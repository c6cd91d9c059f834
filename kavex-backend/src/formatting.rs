//! Text shaping for both directions of the bridge.

/// Discord's message length limit.
pub const MAX_CONTENT_LEN: usize = 2000;
/// Discord's webhook username limit.
pub const MAX_USERNAME_LEN: usize = 80;

pub const DEFAULT_SERVER_NAME: &str = "Minecraft";

const MC_RESET: &str = "§r";
const MC_BOLD: &str = "§l";
const MC_ITALIC: &str = "§o";
const MC_UNDERLINE: &str = "§n";
const MC_STRIKE: &str = "§m";
const MC_CODE: &str = "§0§a";

const ZWSP: char = '\u{200B}';

/// Escape text so Discord renders it literally: markdown is backslash
/// escaped and mass/user/channel mentions are broken with a zero-width
/// space.
pub fn escape_discord(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' | '*' | '_' | '~' | '`' | '|' | '>' => {
                out.push('\\');
                out.push(c);
            }
            '<' if matches!(chars.peek(), Some('@') | Some('#')) => {
                out.push('<');
                out.push(ZWSP);
            }
            _ => out.push(c),
        }
    }
    out.replace("@everyone", "@\u{200B}everyone")
        .replace("@here", "@\u{200B}here")
}

/// Cut to at most `max` characters, marking the cut with an ellipsis.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Discord rejects webhook usernames containing these words.
const RESERVED_USERNAME_WORDS: [&str; 2] = ["discord", "clyde"];

/// Webhook display name: trimmed, truncated, never empty, and with
/// reserved words broken by a zero-width space.
pub fn webhook_username(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        DEFAULT_SERVER_NAME.to_string()
    } else {
        truncate_chars(&break_reserved_words(name), MAX_USERNAME_LEN)
    }
}

fn break_reserved_words(name: &str) -> String {
    // ASCII lowercasing keeps byte offsets aligned with `name`
    let lower = name.to_ascii_lowercase();
    let mut out = String::with_capacity(name.len() + 6);
    let mut next = 0;
    for (i, _) in name.char_indices() {
        if i < next {
            continue;
        }
        match RESERVED_USERNAME_WORDS
            .iter()
            .find(|word| lower[i..].starts_with(**word))
        {
            Some(word) => {
                next = i + word.len();
                out.push_str(&name[i..i + 1]);
                out.push(ZWSP);
                out.push_str(&name[i + 1..next]);
            }
            None => {
                next = i + name[i..].chars().next().map_or(1, char::len_utf8);
                out.push_str(&name[i..next]);
            }
        }
    }
    out
}

/// Message body as posted: escaped, then truncated.
pub fn safe_content(text: &str) -> String {
    truncate_chars(&escape_discord(text), MAX_CONTENT_LEN)
}

pub fn connected_notice(server: &str) -> String {
    format!("🟢 **{}** connected.", escape_discord(server))
}

pub fn disconnected_notice(server: &str) -> String {
    format!(
        "🔴 **{}** disconnected. Waiting for reconnect…",
        escape_discord(server)
    )
}

pub fn join_notice(player: &str) -> String {
    format!("➡️ **{}** joined the game.", escape_discord(player))
}

pub fn quit_notice(player: &str) -> String {
    format!("⬅️ **{}** left the game.", escape_discord(player))
}

pub fn death_notice(death_message: &str) -> String {
    format!("💀 {}", escape_discord(death_message))
}

/// Builds per-player avatar URLs from a template with `{uuid}` and
/// `{player}` placeholders.
#[derive(Debug, Clone)]
pub struct AvatarResolver {
    template: String,
}

impl AvatarResolver {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// `None` when the template is empty or needs a UUID we don't have.
    pub fn resolve(&self, player: &str, uuid: Option<&str>) -> Option<String> {
        if self.template.is_empty() {
            return None;
        }
        let mut url = self.template.replace("{player}", player);
        if url.contains("{uuid}") {
            let uuid: String = uuid?.chars().filter(|c| *c != '-').collect();
            url = url.replace("{uuid}", &uuid);
        }
        Some(url)
    }
}

// ========================================================================
// Discord -> Minecraft
// ========================================================================

/// A guild role as far as chat styling cares.
#[derive(Debug, Clone)]
pub struct RoleInfo {
    pub name: String,
    pub position: u16,
    /// 0 means uncoloured.
    pub color: u32,
    pub hoist: bool,
}

/// Pick the `[Role]` prefix and `#RRGGBB` colour for a member's chat line.
///
/// The prefix comes from the highest hoisted role, else the highest
/// coloured role, else the highest role. The colour comes from the highest
/// coloured role.
pub fn role_style(roles: &[RoleInfo]) -> (Option<String>, Option<String>) {
    let color_role = roles
        .iter()
        .filter(|r| r.color != 0)
        .max_by_key(|r| r.position);

    let prefix_role = roles
        .iter()
        .filter(|r| r.hoist)
        .max_by_key(|r| r.position)
        .or(color_role)
        .or_else(|| roles.iter().max_by_key(|r| r.position));

    (
        prefix_role.map(|r| format!("[{}]", r.name)),
        color_role.map(|r| format!("#{:06X}", r.color & 0xFF_FFFF)),
    )
}

/// Underline `@name` mentions in chat text.
pub fn underline_mentions<'a>(text: &str, names: impl IntoIterator<Item = &'a str>) -> String {
    let mut out = text.to_string();
    for name in names {
        if name.is_empty() {
            continue;
        }
        let needle = format!("@{name}");
        out = out.replace(&needle, &format!("{MC_UNDERLINE}{needle}{MC_RESET}"));
    }
    out
}

/// Translate the common subset of Discord markdown into Minecraft
/// formatting codes. Code spans are left untouched by the other rules.
pub fn discord_markdown_to_minecraft(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for segment in split_code(text) {
        match segment {
            Segment::Code(code) => {
                out.push_str(MC_CODE);
                out.push_str(code);
                out.push_str(MC_RESET);
            }
            Segment::Text(text) => {
                let text = replace_pairs(text, "**", MC_BOLD);
                let text = replace_pairs(&text, "__", MC_UNDERLINE);
                let text = replace_pairs(&text, "~~", MC_STRIKE);
                let text = replace_single(&text, '*', MC_ITALIC);
                let text = replace_single(&text, '_', MC_ITALIC);
                out.push_str(&text);
            }
        }
    }
    out
}

enum Segment<'a> {
    Text(&'a str),
    Code(&'a str),
}

/// Split out ```blocks``` (with an optional language tag) and `inline`
/// code spans.
fn split_code(text: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut pos = 0;

    while let Some(rel) = text[pos..].find('`') {
        let tick = pos + rel;
        let span = if text[tick..].starts_with("```") {
            let body = tick + 3;
            text[body..]
                .find("```")
                .map(|end| (strip_language_tag(&text[body..body + end]), body + end + 3))
        } else {
            let body = tick + 1;
            text[body..]
                .find(['`', '\n'])
                .filter(|&end| end > 0 && text[body + end..].starts_with('`'))
                .map(|end| (&text[body..body + end], body + end + 1))
        };

        match span {
            Some((code, next)) => {
                if tick > text_start {
                    segments.push(Segment::Text(&text[text_start..tick]));
                }
                segments.push(Segment::Code(code));
                text_start = next;
                pos = next;
            }
            // unmatched backtick stays literal
            None => pos = tick + 1,
        }
    }

    if text_start < text.len() {
        segments.push(Segment::Text(&text[text_start..]));
    }
    segments
}

fn strip_language_tag(block: &str) -> &str {
    let tag_len = block
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '-')))
        .unwrap_or(block.len());
    // a first word without a newline after it is content, not a tag
    block[tag_len..].strip_prefix('\n').unwrap_or(block)
}

/// Replace `<delim>body<delim>` with `code body §r`, where body is at least
/// one character on a single line. Matches are shortest-first, left to
/// right.
fn replace_pairs(text: &str, delim: &str, code: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(delim) {
        let body_start = start + delim.len();
        let Some(first) = rest[body_start..].chars().next() else {
            break;
        };
        let search_from = body_start + first.len_utf8();
        match rest[search_from..].find(delim) {
            Some(rel) if !rest[body_start..search_from + rel].contains('\n') => {
                let body_end = search_from + rel;
                out.push_str(&rest[..start]);
                out.push_str(code);
                out.push_str(&rest[body_start..body_end]);
                out.push_str(MC_RESET);
                rest = &rest[body_end + delim.len()..];
            }
            _ => {
                // delimiters are ASCII, so one byte is one char
                out.push_str(&rest[..start + 1]);
                rest = &rest[start + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Replace `*body*` (or `_body_`) where neither marker touches another copy
/// of itself, so leftover `**` runs are not treated as italics.
fn replace_single(text: &str, marker: char, code: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let lone = |i: usize| {
        chars[i] == marker
            && (i == 0 || chars[i - 1] != marker)
            && chars.get(i + 1) != Some(&marker)
    };

    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        if lone(i) {
            let mut close = None;
            let mut j = i + 2;
            while j < chars.len() {
                if chars[j - 1] == '\n' {
                    break;
                }
                if lone(j) {
                    close = Some(j);
                    break;
                }
                j += 1;
            }
            if let Some(j) = close {
                out.push_str(code);
                out.extend(&chars[i + 1..j]);
                out.push_str(MC_RESET);
                i = j + 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}
