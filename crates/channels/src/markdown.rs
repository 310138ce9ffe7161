//! Best-effort markdown degradation for platforms that render plain text
//! only (WeCom family, QQ without markdown approval).
//!
//! The passes run in a fixed order: code blocks, headings, emphasis, lists,
//! inline code, strikethrough, links, images, tables, quotes, rules,
//! whitespace. The output is a fixed point: degrading it again changes
//! nothing.

/// Degrade markdown to plain text.
#[must_use]
pub fn strip_markdown(text: &str) -> String {
    let mut out = degrade_code_blocks(text);
    out = degrade_headings(&out);
    out = strip_pairs_per_line(&out, "**");
    out = strip_pairs_per_line(&out, "__");
    out = strip_pairs_per_line(&out, "*");
    out = degrade_lists(&out);
    out = strip_pairs_per_line(&out, "`");
    out = strip_pairs_per_line(&out, "~~");
    out = degrade_links(&out);
    out = degrade_images(&out);
    out = degrade_tables(&out);
    out = degrade_quotes(&out);
    out = drop_rules(&out);
    collapse_whitespace(&out)
}

/// Fenced code blocks become indented text with a language label line.
fn degrade_code_blocks(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut in_block = false;
    for line in text.split('\n') {
        let trimmed = line.trim_start();
        if let Some(fence_rest) = trimmed.strip_prefix("```") {
            if in_block {
                in_block = false;
            } else {
                in_block = true;
                let lang = fence_rest.trim();
                if !lang.is_empty() {
                    out.push(format!("{lang}:"));
                }
            }
            continue;
        }
        if in_block {
            out.push(format!("    {line}"));
        } else {
            out.push(line.to_string());
        }
    }
    out.join("\n")
}

/// `## Heading` → `【Heading】`. Only unindented headings count; indented
/// `#` lines are usually code.
fn degrade_headings(text: &str) -> String {
    text.split('\n')
        .map(|line| {
            let hashes = line.bytes().take_while(|b| *b == b'#').count();
            if (1..=6).contains(&hashes)
                && let Some(title) = line[hashes..].strip_prefix(' ')
            {
                format!("【{}】", title.trim())
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove paired occurrences of `marker` within each line, leaving
/// unpaired ones alone. Pairs never span lines, so a lone `*` list bullet
/// on one line cannot pair with one on the next.
fn strip_pairs_per_line(text: &str, marker: &str) -> String {
    text.split('\n')
        .map(|line| strip_pairs(line, marker))
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_pairs(text: &str, marker: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let Some(open) = rest.find(marker) else {
            out.push_str(rest);
            return out;
        };
        let after = &rest[open + marker.len()..];
        let Some(close) = after.find(marker) else {
            out.push_str(rest);
            return out;
        };
        out.push_str(&rest[..open]);
        out.push_str(&after[..close]);
        rest = &after[close + marker.len()..];
    }
}

/// `- item` / `* item` / `+ item` → `• item` (at most 3 spaces of indent,
/// deeper indentation is treated as code).
fn degrade_lists(text: &str) -> String {
    text.split('\n')
        .map(|line| {
            let indent_len = line.len() - line.trim_start_matches(' ').len();
            if indent_len > 3 {
                return line.to_string();
            }
            let (indent, rest) = line.split_at(indent_len);
            for marker in ["- ", "* ", "+ "] {
                if let Some(item) = rest.strip_prefix(marker) {
                    return format!("{indent}• {item}");
                }
            }
            line.to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// `[text](url)` → `text (url)`. Image syntax (`![...]`) is left for the
/// image pass.
fn degrade_links(text: &str) -> String {
    rewrite_bracket_pairs(text, false, |label, url| format!("{label} ({url})"))
}

/// `![alt](url)` → `[image: alt]`.
fn degrade_images(text: &str) -> String {
    rewrite_bracket_pairs(text, true, |alt, _url| {
        if alt.is_empty() {
            "[image]".to_string()
        } else {
            format!("[image: {alt}]")
        }
    })
}

fn rewrite_bracket_pairs(
    text: &str,
    images: bool,
    render: impl Fn(&str, &str) -> String,
) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < bytes.len() {
        let is_image_start = bytes[i] == b'!' && bytes.get(i + 1) == Some(&b'[');
        let is_link_start = bytes[i] == b'[' && (i == 0 || bytes[i - 1] != b'!');
        let start_matches = if images { is_image_start } else { is_link_start };
        if !start_matches {
            let ch_len = text[i..].chars().next().map(char::len_utf8).unwrap_or(1);
            out.push_str(&text[i..i + ch_len]);
            i += ch_len;
            continue;
        }

        let bracket = if images { i + 1 } else { i };
        match parse_bracket_link(text, bracket) {
            Some((label, url, end)) => {
                out.push_str(&render(label, url));
                i = end;
            },
            None => {
                let ch_len = text[i..].chars().next().map(char::len_utf8).unwrap_or(1);
                out.push_str(&text[i..i + ch_len]);
                i += ch_len;
            },
        }
    }
    out
}

/// Parse `[label](url)` starting at the `[`; returns `(label, url, end)`.
fn parse_bracket_link(text: &str, open: usize) -> Option<(&str, &str, usize)> {
    let close = text[open..].find(']')? + open;
    if text.as_bytes().get(close + 1) != Some(&b'(') {
        return None;
    }
    let url_end = text[close + 2..].find(')')? + close + 2;
    let label = &text[open + 1..close];
    let url = &text[close + 2..url_end];
    if label.contains('\n') || url.contains('\n') {
        return None;
    }
    Some((label, url, url_end + 1))
}

/// Tables become padded columns separated by two spaces; the separator row
/// is dropped entirely.
fn degrade_tables(text: &str) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        if crate::text::is_table_row(lines[i])
            && i + 1 < lines.len()
            && crate::text::is_separator_row(lines[i + 1])
        {
            let mut rows: Vec<Vec<String>> = vec![crate::text::parse_cells(lines[i])];
            i += 2;
            while i < lines.len() && crate::text::is_table_row(lines[i]) {
                rows.push(crate::text::parse_cells(lines[i]));
                i += 1;
            }
            out.extend(render_padded(&rows));
        } else {
            out.push(lines[i].to_string());
            i += 1;
        }
    }
    out.join("\n")
}

fn render_padded(rows: &[Vec<String>]) -> Vec<String> {
    let cols = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut widths = vec![0usize; cols];
    for row in rows {
        for (c, cell) in row.iter().enumerate() {
            widths[c] = widths[c].max(cell.chars().count());
        }
    }
    rows.iter()
        .map(|row| {
            let mut line = String::new();
            for (c, cell) in row.iter().enumerate() {
                line.push_str(cell);
                if c + 1 < row.len() {
                    let pad = widths[c].saturating_sub(cell.chars().count());
                    for _ in 0..pad + 2 {
                        line.push(' ');
                    }
                }
            }
            line
        })
        .collect()
}

fn degrade_quotes(text: &str) -> String {
    text.split('\n')
        .map(|line| {
            let mut rest = line;
            while let Some(stripped) = rest.strip_prefix("> ").or_else(|| rest.strip_prefix('>')) {
                rest = stripped;
            }
            rest.to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Horizontal rules (`---`, `***`, `___`) are dropped.
fn drop_rules(text: &str) -> String {
    text.split('\n')
        .filter(|line| {
            let t = line.trim();
            !(t.len() >= 3 && (t.chars().all(|c| c == '-') || t.chars().all(|c| c == '*') || t.chars().all(|c| c == '_')))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn collapse_whitespace(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut blank_run = 0;
    for line in text.split('\n') {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push(line);
    }
    out.join("\n").trim_matches('\n').to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("**bold**", "bold")]
    #[case("*italic*", "italic")]
    #[case("`code`", "code")]
    #[case("~~gone~~", "gone")]
    #[case("# Title", "【Title】")]
    #[case("### Deep", "【Deep】")]
    #[case("- item", "• item")]
    #[case("> quoted", "quoted")]
    #[case("[site](https://a.cn)", "site (https://a.cn)")]
    #[case("![logo](https://a.cn/x.png)", "[image: logo]")]
    #[case("![](https://a.cn/x.png)", "[image]")]
    fn degrades(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(strip_markdown(input), expected);
    }

    #[test]
    fn code_block_is_indented_with_language_label() {
        let out = strip_markdown("```rust\nfn main() {}\n```");
        assert_eq!(out, "rust:\n    fn main() {}");
    }

    #[test]
    fn code_block_without_language_has_no_label() {
        let out = strip_markdown("```\nplain\n```");
        assert_eq!(out, "    plain");
    }

    #[test]
    fn table_becomes_padded_columns() {
        let out = strip_markdown("| Name | Age |\n|------|-----|\n| Alice | 30 |");
        assert!(out.contains("Name"));
        assert!(out.contains("Alice"));
        assert!(!out.contains('|'), "{out}");
        // Columns are aligned: "Name " padded to the width of "Alice".
        assert!(out.starts_with("Name  "), "{out}");
    }

    #[test]
    fn rules_are_dropped_and_blank_runs_collapse() {
        let out = strip_markdown("a\n\n\n\n---\n\nb");
        assert_eq!(out, "a\n\nb");
    }

    #[test]
    fn unpaired_markers_survive() {
        assert_eq!(strip_markdown("2 * 3 = 6 and a_b"), "2 * 3 = 6 and a_b");
    }

    #[rstest]
    #[case("**b** and `c` with [l](u) and ![i](u)\n\n# H\n- x\n> q")]
    #[case("| A | B |\n|---|---|\n| 1 | 2 |")]
    #[case("```py\nprint('*hi*')\n```\ntext **after**")]
    #[case("plain text, no markdown at all")]
    fn degradation_is_idempotent(#[case] input: &str) {
        let once = strip_markdown(input);
        let twice = strip_markdown(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn mixed_document() {
        let input = "# Report\nSee [docs](https://d.cn).\n\n```sh\nls -l\n```\n\n| K | V |\n|---|---|\n| a | 1 |";
        let out = strip_markdown(input);
        assert!(out.contains("【Report】"));
        assert!(out.contains("docs (https://d.cn)"));
        assert!(out.contains("sh:"));
        assert!(out.contains("    ls -l"));
        assert!(!out.contains('|'));
    }
}
