//! Text formatting for messages relayed to Discord.

/// Discord rejects message content longer than this.
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;

pub fn oversized_file_notice(ceiling_bytes: u64) -> String {
    format!(
        "Received a file, but it's over {}. Check WhatsApp on your phone.",
        human_size(ceiling_bytes)
    )
}

/// Whole megabytes or kilobytes, rounded to nearest.
fn human_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    if bytes >= MB {
        format!("{}MB", (bytes + MB / 2) / MB)
    } else if bytes >= KB {
        format!("{}KB", (bytes + KB / 2) / KB)
    } else {
        format!("{bytes} bytes")
    }
}

pub fn download_failed_notice(error: &str) -> String {
    format!("Received a file, but can't send it here. Check WhatsApp on your phone. Error: {error}")
}

/// Split a message into chunks of at most `max_len` bytes, preferring line
/// breaks near the end of a chunk and never cutting inside a character.
pub fn split_message(text: &str, max_len: usize) -> Vec<&str> {
    if text.len() <= max_len {
        return vec![text];
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // max_len smaller than one character
            end = start + text[start..].chars().next().map_or(1, char::len_utf8);
        }
        let break_at = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .filter(|&pos| pos + 200 > end - start)
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };
        chunks.push(&text[start..break_at]);
        start = break_at;
    }
    chunks
}

/// `> line` for every line of `text`.
pub fn quote_block(text: &str) -> String {
    text.lines()
        .map(|line| format!("> {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Body of a WhatsApp message as shown on Discord.
pub fn render_inbound(text: &str, quote: Option<(&str, &str)>, forwarded: bool) -> String {
    let mut out = String::new();
    if let Some((author, quoted)) = quote {
        let mut lines = quoted.lines();
        let first = lines.next().unwrap_or_default();
        out.push_str(&format!("> {author}: {first}"));
        for line in lines {
            out.push_str(&format!("\n> {line}"));
        }
        out.push('\n');
    }
    if forwarded {
        out.push_str("forwarded message:\n");
        out.push_str(&quote_block(text));
    } else {
        out.push_str(text);
    }
    out
}

/// `[name] text`
pub fn with_name_prefix(name: &str, text: &str) -> String {
    if text.is_empty() {
        format!("[{name}]")
    } else {
        format!("[{name}] {text}")
    }
}

/// `**name**: text`, used where no webhook carries the sender's name.
pub fn with_bold_sender(name: &str, text: &str) -> String {
    if text.is_empty() {
        format!("**{name}**")
    } else {
        format!("**{name}**: {text}")
    }
}
