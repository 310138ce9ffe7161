//! Text chunking for platform message limits.

/// Per-channel default chunk limits, applied when the account config does
/// not override `textChunkLimit`.
#[must_use]
pub fn default_chunk_limit(channel: &str) -> usize {
    match channel {
        "dingtalk" | "feishu" => 4000,
        "qqbot" => 1500,
        "wecom" | "wecom-app" => 2048,
        _ => 2000,
    }
}

#[must_use]
pub fn resolve_chunk_limit(channel: &str, configured: Option<usize>) -> usize {
    configured
        .filter(|n| *n > 0)
        .unwrap_or_else(|| default_chunk_limit(channel))
}

/// How markdown tables are prepared before chunking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TableMode {
    /// Leave tables alone (platform renders markdown tables).
    #[default]
    Keep,
    /// Rewrite tables as bullet lists (platform renders markdown but not
    /// tables).
    Bullets,
}

/// Split plain text into chunks of at most `max_len` bytes, preferring
/// newline and space boundaries. Concatenating the chunks loses no
/// characters beyond the whitespace that was split on.
#[must_use]
pub fn chunk_text(text: &str, max_len: usize) -> Vec<String> {
    if max_len == 0 || text.is_empty() {
        return Vec::new();
    }
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut window_end = floor_char_boundary(remaining, max_len);
        if window_end == 0 {
            window_end = remaining
                .chars()
                .next()
                .map(char::len_utf8)
                .unwrap_or(remaining.len());
        }

        let slice = &remaining[..window_end];
        let split_at = slice
            .rfind('\n')
            .or_else(|| slice.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(window_end);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start_matches('\n');
        if let Some(stripped) = remaining.strip_prefix(' ') {
            remaining = stripped;
        }
    }

    chunks
}

/// Split markdown into chunks without cutting through fenced code blocks:
/// a fence left open at a chunk boundary is closed there and reopened in
/// the next chunk.
#[must_use]
pub fn chunk_markdown_text(text: &str, max_len: usize) -> Vec<String> {
    if max_len == 0 || text.is_empty() {
        return Vec::new();
    }
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    // Reserve room for a closing fence we may need to append.
    let budget = max_len.saturating_sub(4).max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut open_fence: Option<String> = None;

    for line in text.split('\n') {
        let projected = current.len() + line.len() + usize::from(!current.is_empty());
        if projected > budget && !current.is_empty() {
            if open_fence.is_some() {
                current.push_str("\n```");
            }
            chunks.push(std::mem::take(&mut current));
            if let Some(fence) = &open_fence {
                current.push_str(fence);
            }
        }

        // A single line longer than the budget falls back to hard splits.
        if line.len() > budget {
            for piece in chunk_text(line, budget) {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                }
                current = piece;
            }
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }

        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            open_fence = match open_fence {
                Some(_) => None,
                None => Some(trimmed.to_string()),
            };
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Rewrite markdown tables as bullet lists for platforms that render
/// markdown but not tables. Non-table lines pass through unchanged.
#[must_use]
pub fn convert_tables(text: &str, mode: TableMode) -> String {
    if mode == TableMode::Keep {
        return text.to_string();
    }

    let lines: Vec<&str> = text.split('\n').collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        if is_table_row(lines[i]) && i + 1 < lines.len() && is_separator_row(lines[i + 1]) {
            let header = parse_cells(lines[i]);
            i += 2;
            while i < lines.len() && is_table_row(lines[i]) {
                let cells = parse_cells(lines[i]);
                let title = cells.first().cloned().unwrap_or_default();
                let mut item = format!("- {title}");
                for (idx, cell) in cells.iter().enumerate().skip(1) {
                    let label = header.get(idx).map(String::as_str).unwrap_or("-");
                    item.push_str(&format!("; {label}: {cell}"));
                }
                out.push(item);
                i += 1;
            }
        } else {
            out.push(lines[i].to_string());
            i += 1;
        }
    }
    out.join("\n")
}

pub(crate) fn is_table_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.len() > 1
        && (trimmed.starts_with('|') || trimmed.chars().filter(|&c| c == '|').count() >= 2)
}

pub(crate) fn is_separator_row(line: &str) -> bool {
    let trimmed = line.trim();
    let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    !inner.is_empty()
        && inner.split('|').all(|cell| {
            let c = cell.trim();
            !c.is_empty() && c.chars().all(|ch| ch == '-' || ch == ':')
        })
}

pub(crate) fn parse_cells(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner.split('|').map(|cell| cell.trim().to_string()).collect()
}

pub(crate) fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, rstest::rstest};

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("hello", 100), vec!["hello"]);
    }

    #[test]
    fn chunks_prefer_newlines() {
        let chunks = chunk_text("line1\nline2\nline3", 10);
        assert_eq!(chunks, vec!["line1", "line2", "line3"]);
    }

    #[test]
    fn chunks_prefer_spaces() {
        let chunks = chunk_text("hello world foo bar", 10);
        assert_eq!(chunks[0], "hello");
        assert!(chunks.iter().all(|c| c.len() <= 10));
    }

    #[test]
    fn no_content_is_lost() {
        let text = "字".repeat(1000) + " tail";
        let chunks = chunk_text(&text, 128);
        let joined: String = chunks.concat();
        let original: String = text.chars().filter(|c| *c != ' ' && *c != '\n').collect();
        let rejoined: String = joined.chars().filter(|c| *c != ' ' && *c != '\n').collect();
        assert_eq!(rejoined, original);
        assert!(chunks.iter().all(|c| c.len() <= 128));
    }

    #[test]
    fn utf8_boundaries_are_respected() {
        let text = format!("{}中z", "a".repeat(2047));
        let chunks = chunk_text(&text, 2048);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() <= 2048));
    }

    #[test]
    fn markdown_chunks_keep_fences_balanced() {
        let body = "x".repeat(40);
        let text = format!("```rust\n{}\n{}\n{}\n```", body, body, body);
        let chunks = chunk_markdown_text(&text, 64);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(
                chunk.matches("```").count() % 2,
                0,
                "unbalanced fence in {chunk:?}"
            );
        }
    }

    #[test]
    fn bullets_mode_rewrites_tables() {
        let text = "intro\n| Name | Age |\n|---|---|\n| Alice | 30 |\noutro";
        let out = convert_tables(text, TableMode::Bullets);
        assert!(out.contains("- Alice; Age: 30"), "{out}");
        assert!(out.contains("intro"));
        assert!(out.contains("outro"));
        assert!(!out.contains("|---"));
    }

    #[test]
    fn keep_mode_is_identity() {
        let text = "| A | B |\n|---|---|\n| 1 | 2 |";
        assert_eq!(convert_tables(text, TableMode::Keep), text);
    }

    #[rstest]
    #[case("dingtalk", 4000)]
    #[case("qqbot", 1500)]
    #[case("wecom", 2048)]
    #[case("wecom-app", 2048)]
    fn platform_limits(#[case] channel: &str, #[case] limit: usize) {
        assert_eq!(resolve_chunk_limit(channel, None), limit);
    }

    #[test]
    fn configured_limit_wins() {
        assert_eq!(resolve_chunk_limit("dingtalk", Some(500)), 500);
        assert_eq!(resolve_chunk_limit("dingtalk", Some(0)), 4000);
    }
}
