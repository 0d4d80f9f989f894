//! Robust extraction of JSON payloads from model text. Models wrap answers
//! in prose, code fences, and typographic quotes; every consumer of a model
//! response goes through these helpers before `serde_json`.

/// Normalize typographic characters and strip trailing commas that break
/// strict JSON parsing.
pub fn sanitize_model_json(text: &str) -> String {
    let mut s = text.to_string();

    s = s.replace('\u{201c}', "\"");
    s = s.replace('\u{201d}', "\"");
    s = s.replace('\u{2018}', "'");
    s = s.replace('\u{2019}', "'");
    s = s.replace('\u{00a0}', " ");
    s = s.replace('\u{feff}', "");

    // Drop trailing commas before a closing brace/bracket.
    let bytes = s.as_bytes();
    let mut cleaned = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b',' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            if j < bytes.len() && (bytes[j] == b'}' || bytes[j] == b']') {
                i += 1;
                continue;
            }
        }
        cleaned.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(cleaned).unwrap_or(s)
}

/// Pull the first balanced JSON object out of model text, checking fenced
/// blocks before scanning for a bare brace.
pub fn extract_json(text: &str) -> Option<String> {
    if let Some(balanced) = balanced_object(text, 0) {
        if text.trim_start().starts_with('{') {
            return Some(balanced);
        }
    }

    if let Some(start) = text.find("```json") {
        let after = &text[start + 7..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if !inner.is_empty() {
                return Some(inner.to_string());
            }
        }
    }

    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return Some(inner.to_string());
            }
        }
    }

    let start = text.find('{')?;
    balanced_object(text, start)
}

/// Scan from `start` for a brace-balanced object, respecting strings.
fn balanced_object(text: &str, start: usize) -> Option<String> {
    let s = &text[start..];
    let open = s.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut prev = ' ';
    for (i, c) in s[open..].char_indices() {
        if c == '"' && prev != '\\' {
            in_string = !in_string;
        }
        if !in_string {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(s[open..open + i + c.len_utf8()].to_string());
                    }
                }
                _ => {}
            }
        }
        prev = c;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bare_object() {
        let out = extract_json("{\"a\": 1}").unwrap();
        assert_eq!(out, "{\"a\": 1}");
    }

    #[test]
    fn extracts_from_fenced_block() {
        let text = "Sure:\n```json\n{\"type\": \"send_msg\"}\n```\nDone.";
        assert_eq!(extract_json(text).unwrap(), "{\"type\": \"send_msg\"}");
    }

    #[test]
    fn extracts_embedded_object_from_prose() {
        let text = "The answer is {\"found\": true, \"note\": \"a {brace} in string\"} ok";
        let out = extract_json(text).unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["found"], true);
    }

    #[test]
    fn sanitize_fixes_smart_quotes_and_trailing_commas() {
        let dirty = "{\u{201c}type\u{201d}: \u{201c}send_msg\u{201d}, }";
        let clean = sanitize_model_json(dirty);
        let v: serde_json::Value = serde_json::from_str(&clean).unwrap();
        assert_eq!(v["type"], "send_msg");
    }

    #[test]
    fn no_json_yields_none() {
        assert!(extract_json("no structured data here").is_none());
    }

    #[test]
    fn handles_multibyte_text_around_json() {
        let text = "好的，结果：{\"recipient\": \"张三\"}";
        let out = extract_json(text).unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["recipient"], "张三");
    }
}
