//! Best-effort structured JSON extraction from free-form LLM replies.
//!
//! Several agents ask the model for a JSON payload embedded in an otherwise conversational
//! response, and the reply is sometimes truncated mid-stream (token budget, client cancel). This
//! module applies a fixed cascade of heuristics, each one a little more forgiving than the last,
//! and returns the first one that parses. Extraction is inherently best-effort: callers must
//! treat `None` as "no structured payload available" and fall back to the raw text, never as a
//! fatal error.

use serde_json::Value;

/// Extracts the most likely JSON value embedded in `text`, trying (in order):
/// 1. the first ```json fenced block that parses,
/// 2. any fenced block (of any or no language tag) that starts with `{` or `[` and parses,
/// 3. a trailing, unterminated ```json block, repaired by closing dangling brackets/braces,
/// 4. the largest balanced `{...}` or `[...]` span found anywhere in the text.
///
/// Returns `None` if nothing in the cascade parses. This is expected on plain-prose replies and
/// is not itself an error condition.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(value) = fenced_json_blocks(text).find_map(|block| try_parse(block.trim())) {
        return Some(value);
    }

    if let Some(value) = any_fenced_blocks(text)
        .map(|block| block.trim())
        .filter(|block| block.starts_with('{') || block.starts_with('['))
        .find_map(try_parse)
    {
        return Some(value);
    }

    if let Some(raw) = trailing_unclosed_json_block(text) {
        if let Some(value) = try_parse(raw.trim()) {
            return Some(value);
        }
        if let Some(repaired) = repair_truncated_json(raw.trim()) {
            if let Some(value) = try_parse(&repaired) {
                return Some(value);
            }
        }
    }

    largest_balanced_span(text).and_then(|span| try_parse(span))
}

fn try_parse(text: &str) -> Option<Value> {
    if text.is_empty() {
        return None;
    }
    serde_json::from_str(text).ok()
}

/// Yields the contents of every ` ```json ... ``` ` fenced block, in order of appearance.
fn fenced_json_blocks(text: &str) -> impl Iterator<Item = &str> {
    fenced_blocks_with_tag(text, Some("json"))
}

/// Yields the contents of every fenced block regardless of language tag.
fn any_fenced_blocks(text: &str) -> impl Iterator<Item = &str> {
    fenced_blocks_with_tag(text, None)
}

fn fenced_blocks_with_tag<'a>(text: &'a str, tag: Option<&'static str>) -> impl Iterator<Item = &'a str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    let mut base_offset = 0usize;

    while let Some(start_rel) = rest.find("```") {
        let after_fence = start_rel + 3;
        let line_end = rest[after_fence..].find('\n').map(|i| after_fence + i);
        let (lang, body_start) = match line_end {
            Some(nl) => (rest[after_fence..nl].trim(), nl + 1),
            None => break,
        };

        let Some(close_rel) = rest[body_start..].find("```") else {
            break;
        };
        let close_abs = body_start + close_rel;

        let matches_tag = match tag {
            Some(wanted) => lang.eq_ignore_ascii_case(wanted),
            None => true,
        };
        if matches_tag {
            let global_start = base_offset + body_start;
            let global_end = base_offset + close_abs;
            blocks.push((global_start, global_end));
        }

        let advance = close_abs + 3;
        base_offset += advance;
        rest = &rest[advance..];
    }

    blocks.into_iter().map(move |(s, e)| &text[s..e])
}

/// Finds a ```json fence with no matching close, returning everything after its language tag line.
fn trailing_unclosed_json_block(text: &str) -> Option<&str> {
    let mut search_from = 0;
    let mut last_candidate = None;

    while let Some(rel) = text[search_from..].find("```json") {
        let abs = search_from + rel;
        let after_tag = abs + "```json".len();
        let body_start = text[after_tag..]
            .find('\n')
            .map(|i| after_tag + i + 1)
            .unwrap_or(after_tag);

        if !text[body_start..].contains("```") {
            last_candidate = Some(&text[body_start..]);
        }
        search_from = after_tag;
    }

    last_candidate
}

/// Closes dangling `{`/`[` by counting bracket depth outside of string literals, trimming a
/// trailing comma first. Returns `None` when the text is not actually truncated (balanced already).
fn repair_truncated_json(text: &str) -> Option<String> {
    let mut open_braces = 0i32;
    let mut open_brackets = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for c in text.chars() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => open_braces += 1,
            '}' => open_braces -= 1,
            '[' => open_brackets += 1,
            ']' => open_brackets -= 1,
            _ => {}
        }
    }

    if open_braces <= 0 && open_brackets <= 0 {
        return None;
    }

    let mut trimmed = text.trim_end().to_string();
    if trimmed.ends_with(',') {
        trimmed.pop();
    }

    for _ in 0..open_brackets.max(0) {
        trimmed.push(']');
    }
    for _ in 0..open_braces.max(0) {
        trimmed.push('}');
    }
    Some(trimmed)
}

/// Scans the whole text for top-level `{...}`/`[...]` spans (ignoring braces inside string
/// literals) and returns the longest one, on the theory that the real payload is usually the
/// largest structured chunk in an otherwise prose reply.
fn largest_balanced_span(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut best: Option<(usize, usize)> = None;

    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '{' || c == '[' {
            if let Some(end) = matching_close(text, i) {
                let span = (i, end + 1);
                let is_longer = best.map(|(s, e)| span.1 - span.0 > e - s).unwrap_or(true);
                if is_longer {
                    best = Some(span);
                }
            }
        }
        i += 1;
    }

    best.map(|(s, e)| &text[s..e])
}

/// Given the byte index of an opening `{`/`[` in `text`, finds the index of its matching close,
/// skipping over string-literal contents. Returns `None` if unbalanced.
fn matching_close(text: &str, open_idx: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let open = bytes[open_idx] as char;
    let close = if open == '{' { '}' } else { ']' };
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    let mut i = open_idx;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if escape {
            escape = false;
            i += 1;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            i += 1;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            i += 1;
            continue;
        }
        if !in_string {
            if c == open {
                depth += 1;
            } else if c == close {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_json_fenced_block() {
        let text = "Here is the result:\n```json\n{\"a\": 1}\n```\nThanks.";
        assert_eq!(extract_json(text), Some(serde_json::json!({"a": 1})));
    }

    #[test]
    fn prefers_json_fence_over_plain_fence() {
        let text = "```\n{\"wrong\": true}\n```\n```json\n{\"right\": true}\n```";
        assert_eq!(extract_json(text), Some(serde_json::json!({"right": true})));
    }

    #[test]
    fn falls_back_to_any_fenced_block() {
        let text = "```\n[1, 2, 3]\n```";
        assert_eq!(extract_json(text), Some(serde_json::json!([1, 2, 3])));
    }

    #[test]
    fn repairs_truncated_fenced_json() {
        let text = "```json\n{\"chapters\": [{\"id\": \"ch-1\", \"title\": \"Intro\"";
        let value = extract_json(text).expect("repaired JSON should parse");
        assert_eq!(value["chapters"][0]["id"], "ch-1");
    }

    #[test]
    fn falls_back_to_largest_balanced_span_with_no_fence() {
        let text = "The model said roughly {\"ok\": true, \"n\": 3} and nothing else.";
        assert_eq!(extract_json(text), Some(serde_json::json!({"ok": true, "n": 3})));
    }

    #[test]
    fn returns_none_for_plain_prose() {
        assert_eq!(extract_json("just a sentence, no structure here"), None);
    }

    #[test]
    fn ignores_braces_inside_string_literals_when_balancing() {
        let text = "noise {\"a\": \"text with } inside\", \"b\": 2} trailing";
        assert_eq!(
            extract_json(text),
            Some(serde_json::json!({"a": "text with } inside", "b": 2}))
        );
    }
}
