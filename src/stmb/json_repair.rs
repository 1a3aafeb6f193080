//! Recover structured records from free-text model output.
//!
//! Everything here is pure: text in, record or classified error out.
//! Candidate strings come from small extractors tried in a fixed order
//! (fenced blocks, the whole text, the first balanced `{}`/`[]` span) and
//! each candidate goes through a strict parse, then a lenient one.

use crate::error::{AiErrorCode, AiResponseError};
use serde_json::Value;

/// Text shorter than this is never judged an unfinished sentence.
const INCOMPLETE_SENTENCE_MIN_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryJson {
    pub title: String,
    pub content: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArcDraft {
    pub title: String,
    pub summary: String,
    pub keywords: Vec<String>,
    /// `None` when the model omitted membership entirely.
    pub member_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArcJson {
    pub arcs: Vec<ArcDraft>,
    pub unassigned: Vec<String>,
}

#[derive(Debug, Clone)]
struct FieldError {
    code: AiErrorCode,
    message: String,
}

impl FieldError {
    fn new(code: AiErrorCode, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }
}

/// Parse a memory record out of raw model text.
pub fn parse_model_json(raw: &str) -> Result<MemoryJson, AiResponseError> {
    parse_with(raw, validate_memory)
}

/// Parse an arc analysis out of raw model text.
pub fn parse_arc_json(raw: &str) -> Result<ArcJson, AiResponseError> {
    parse_with(raw, validate_arcs)
}

/// Flatten a provider response body into plain text.
///
/// Handles a bare string, a `content` array of typed blocks, a `content`
/// string, and a `candidates[0].content.parts` structure.
pub fn unwrap_envelope(body: &Value) -> Result<String, AiResponseError> {
    let empty = || {
        AiResponseError::new(
            AiErrorCode::EmptyOrInvalid,
            "AI response is empty or invalid",
            body.to_string(),
        )
    };

    if let Some(text) = body.as_str() {
        return non_blank(text).ok_or_else(empty);
    }
    if let Some(blocks) = body.get("content").and_then(Value::as_array) {
        let joined = blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str).is_none_or(|t| t == "text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
        return non_blank(&joined).ok_or_else(empty);
    }
    if let Some(text) = body.get("content").and_then(Value::as_str) {
        return non_blank(text).ok_or_else(empty);
    }
    if let Some(parts) = body
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
    {
        let joined = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<String>();
        return non_blank(&joined).ok_or_else(empty);
    }
    Err(empty())
}

fn non_blank(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn parse_with<T>(
    raw: &str,
    validate: fn(&Value) -> Result<T, FieldError>,
) -> Result<T, AiResponseError> {
    let normalized = normalize_text(&strip_think_blocks(raw.trim()));

    let mut last_field_error = None;
    let parsed = first_success(candidates(&normalized), |candidate| {
        let value = parse_lenient(candidate).ok_or(())?;
        validate(&value).map_err(|err| {
            last_field_error = Some(err);
        })
    });
    match parsed {
        Some(record) => Ok(record),
        None => Err(classify_failure(&normalized, raw, last_field_error)),
    }
}

/// First `attempt` that succeeds, in candidate order.
pub fn first_success<T, E>(
    candidates: impl IntoIterator<Item = String>,
    mut attempt: impl FnMut(&str) -> Result<T, E>,
) -> Option<T> {
    candidates
        .into_iter()
        .find_map(|candidate| attempt(&candidate).ok())
}

/// Ordered, de-duplicated parse candidates.
fn candidates(normalized: &str) -> Vec<String> {
    let mut out: Vec<String> = extract_fenced_blocks(normalized);
    let single: [fn(&str) -> Option<String>; 2] = [whole_text, extract_balanced_json];
    out.extend(single.iter().filter_map(|extract| extract(normalized)));

    let mut seen = std::collections::HashSet::new();
    out.retain(|c| seen.insert(c.clone()));
    out
}

fn whole_text(text: &str) -> Option<String> {
    non_blank(text.trim())
}

/// CRLF to LF, leading BOM removed, zero-width and control characters dropped.
pub fn normalize_text(input: &str) -> String {
    let unified = input.replace("\r\n", "\n").replace('\r', "\n");
    let without_bom = unified.strip_prefix('\u{FEFF}').unwrap_or(&unified);
    without_bom
        .chars()
        .filter(|&c| {
            if c == '\n' || c == '\t' {
                return true;
            }
            !(c.is_control() || matches!(c, '\u{200B}'..='\u{200D}' | '\u{2060}'))
        })
        .collect()
}

/// Drop every closed `<think>…</think>` block, ignoring ASCII case.
pub fn strip_think_blocks(input: &str) -> String {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";
    let lower = input.to_ascii_lowercase();
    let mut out = String::with_capacity(input.len());
    let mut cursor = 0;
    while let Some(open_rel) = lower[cursor..].find(OPEN) {
        let open = cursor + open_rel;
        let Some(close_rel) = lower[open + OPEN.len()..].find(CLOSE) else {
            break;
        };
        let close_end = open + OPEN.len() + close_rel + CLOSE.len();
        out.push_str(&input[cursor..open]);
        cursor = close_end;
    }
    out.push_str(&input[cursor..]);
    out
}

/// Bodies of ```` ```lang … ``` ```` fences, trimmed, in order of appearance.
pub fn extract_fenced_blocks(text: &str) -> Vec<String> {
    const FENCE: &str = "```";
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find(FENCE) {
        let after_open = &rest[open + FENCE.len()..];
        let lang_len = after_open
            .char_indices()
            .find(|(_, c)| !(c.is_alphanumeric() || *c == '_' || *c == '-'))
            .map(|(i, _)| i)
            .unwrap_or(after_open.len());
        let body_start = &after_open[lang_len..];
        let Some(close) = body_start.find(FENCE) else {
            break;
        };
        let body = body_start[..close].trim();
        if !body.is_empty() {
            out.push(body.to_string());
        }
        rest = &body_start[close + FENCE.len()..];
    }
    out
}

/// First balanced `{…}` or `[…]` span, skipping delimiters inside strings.
pub fn extract_balanced_json(text: &str) -> Option<String> {
    let start = text.find(['{', '['].as_slice())?;
    let open = text[start..].chars().next()?;
    let close = if open == '{' { '}' } else { ']' };
    let mut depth = 0i64;
    let mut in_string = false;
    let mut escaping = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaping {
                escaping = false;
            } else if ch == '\\' {
                escaping = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                let end = start + offset + ch.len_utf8();
                return Some(text[start..end].trim().to_string());
            }
        }
    }
    None
}

/// True when the text ends inside a string or with unmatched braces/brackets.
pub fn likely_unbalanced(text: &str) -> bool {
    let mut braces = 0i64;
    let mut brackets = 0i64;
    let mut in_string = false;
    let mut escaping = false;
    for ch in text.chars() {
        if in_string {
            if escaping {
                escaping = false;
            } else if ch == '\\' {
                escaping = true;
            } else if ch == '"' {
                in_string = false;
            }
        } else {
            match ch {
                '"' => in_string = true,
                '{' => braces += 1,
                '}' => braces -= 1,
                '[' => brackets += 1,
                ']' => brackets -= 1,
                _ => {}
            }
        }
        if braces < 0 || brackets < 0 {
            return true;
        }
    }
    in_string || braces != 0 || brackets != 0
}

/// Short text, or text ending in `.`, `!`, `?` (optionally followed by one
/// closing quote, paren, or bracket).
pub fn ends_nicely(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }
    let mut tail = trimmed.chars().rev();
    let last = tail.next();
    let before = tail.next();
    let terminal = |c: Option<char>| matches!(c, Some('.' | '!' | '?'));
    let closer = |c: Option<char>| matches!(c, Some('"' | '\'' | '’' | ')' | ']'));
    if terminal(last) || (closer(last) && terminal(before)) {
        return true;
    }
    trimmed.chars().count() < INCOMPLETE_SENTENCE_MIN_CHARS
}

fn has_json_delimiter(text: &str) -> bool {
    text.contains('{') || text.contains('[')
}

fn classify_failure(normalized: &str, raw: &str, field_error: Option<FieldError>) -> AiResponseError {
    let (code, message) = if !has_json_delimiter(normalized) {
        (
            AiErrorCode::NoJsonBlock,
            "model response contains no JSON object".to_string(),
        )
    } else if likely_unbalanced(normalized) {
        (
            AiErrorCode::Unbalanced,
            "model response JSON is unbalanced and was likely cut off".to_string(),
        )
    } else if !ends_nicely(normalized) {
        (
            AiErrorCode::IncompleteSentence,
            "model response ends mid-sentence and was likely cut off".to_string(),
        )
    } else if let Some(field) = field_error {
        (field.code, field.message)
    } else {
        (
            AiErrorCode::Malformed,
            "model response JSON could not be parsed".to_string(),
        )
    };
    AiResponseError::new(code, message, raw)
}

/// Strict parse, then the lenient repair parse.
pub fn parse_lenient(candidate: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        return Some(value);
    }
    let repaired = repair_dirty_json(candidate);
    json5::from_str::<Value>(&repaired).ok()
}

/// Pre-pass for the JSON5 parser: smart quotes become ASCII, raw newlines and
/// tabs inside strings get escaped, and Python-style literals become JSON.
/// JSON5 itself then covers trailing commas, single quotes, and bare keys.
pub fn repair_dirty_json(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut quote: Option<char> = None;
    let mut escaping = false;
    let mut word = String::new();

    let flush_word = |word: &mut String, out: &mut String| {
        match word.as_str() {
            "True" => out.push_str("true"),
            "False" => out.push_str("false"),
            "None" => out.push_str("null"),
            _ => out.push_str(word),
        }
        word.clear();
    };

    for ch in input.chars() {
        let ch = match ch {
            '“' | '”' => '"',
            '‘' | '’' if quote != Some('"') => '\'',
            other => other,
        };
        if let Some(q) = quote {
            if escaping {
                escaping = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escaping = true;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\t' => out.push_str("\\t"),
                c if c == q => {
                    quote = None;
                    out.push(c);
                }
                c => out.push(c),
            }
            continue;
        }
        if ch.is_alphanumeric() || ch == '_' {
            word.push(ch);
            continue;
        }
        flush_word(&mut word, &mut out);
        if ch == '"' || ch == '\'' {
            quote = Some(ch);
        }
        out.push(ch);
    }
    flush_word(&mut word, &mut out);
    out
}

fn string_field(obj: &serde_json::Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        obj.get(*name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn clean_keywords(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

fn validate_memory(value: &Value) -> Result<MemoryJson, FieldError> {
    let Some(obj) = value.as_object() else {
        return Err(FieldError::new(
            AiErrorCode::Malformed,
            "model response JSON is not an object",
        ));
    };
    let content = string_field(obj, &["content", "summary", "memory_content"]).ok_or_else(|| {
        FieldError::new(
            AiErrorCode::MissingFieldsContent,
            "model response is missing content",
        )
    })?;
    let title = string_field(obj, &["title"]).ok_or_else(|| {
        FieldError::new(AiErrorCode::MissingFieldsTitle, "model response is missing a title")
    })?;
    let keywords = obj
        .get("keywords")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            FieldError::new(
                AiErrorCode::InvalidKeywords,
                "model response keywords must be an array",
            )
        })?;
    Ok(MemoryJson {
        title,
        content,
        keywords: clean_keywords(keywords),
    })
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_blank(s.trim()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(obj) => obj.get("id").and_then(id_string),
        _ => None,
    }
}

fn validate_arcs(value: &Value) -> Result<ArcJson, FieldError> {
    let (arcs, unassigned) = match value {
        Value::Array(items) => (items.as_slice(), None),
        Value::Object(obj) => {
            let arcs = obj.get("arcs").and_then(Value::as_array).ok_or_else(|| {
                FieldError::new(AiErrorCode::Malformed, "arc response is missing an arcs array")
            })?;
            let unassigned = obj
                .get("unassigned_memories")
                .or_else(|| obj.get("unassigned"))
                .and_then(Value::as_array);
            (arcs.as_slice(), unassigned)
        }
        _ => {
            return Err(FieldError::new(
                AiErrorCode::Malformed,
                "arc response JSON is not an object",
            ));
        }
    };

    let drafts = arcs
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|arc| {
            let title = string_field(arc, &["title"])?;
            let summary = string_field(arc, &["summary", "content"])?;
            let keywords = arc
                .get("keywords")
                .and_then(Value::as_array)
                .map(|k| clean_keywords(k))
                .unwrap_or_default();
            let member_ids = arc
                .get("member_ids")
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(id_string).collect::<Vec<_>>());
            Some(ArcDraft {
                title,
                summary,
                keywords,
                member_ids,
            })
        })
        .collect();

    Ok(ArcJson {
        arcs: drafts,
        unassigned: unassigned
            .map(|items| items.iter().filter_map(id_string).collect())
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const VALID: &str = r#"{"title":"Ambush","content":"The party was ambushed at the bridge.","keywords":["bridge","ambush"]}"#;

    fn ambush() -> MemoryJson {
        MemoryJson {
            title: "Ambush".to_string(),
            content: "The party was ambushed at the bridge.".to_string(),
            keywords: vec!["bridge".to_string(), "ambush".to_string()],
        }
    }

    #[test]
    fn parses_plain_json() {
        assert_eq!(parse_model_json(VALID).expect("parse"), ambush());
    }

    #[test]
    fn fenced_json_inside_prose_round_trips() {
        let records = [
            ambush(),
            MemoryJson {
                title: "Quote \"test\"".to_string(),
                content: "Line one.\nLine two with {braces} and [brackets].".to_string(),
                keywords: vec![],
            },
            MemoryJson {
                title: "Ünïcode ✓".to_string(),
                content: "Emoji 🐉 and backslash \\ survive.".to_string(),
                keywords: vec!["dragon".to_string()],
            },
        ];
        for record in records {
            let body = json!({
                "title": record.title,
                "content": record.content,
                "keywords": record.keywords,
            });
            let wrapped = format!(
                "Sure! Here is the memory you asked for:\n```json\n{}\n```\nLet me know if you want changes.",
                serde_json::to_string_pretty(&body).expect("json")
            );
            assert_eq!(parse_model_json(&wrapped).expect("parse"), record);
        }
    }

    #[test]
    fn strips_think_blocks_before_parsing() {
        let raw = format!("<THINK>pondering {{ \"title\": </Think>{VALID}");
        assert_eq!(parse_model_json(&raw).expect("parse"), ambush());
    }

    #[test]
    fn balanced_substring_is_found_in_prose() {
        let raw = format!("The memory is {VALID} and that is all.");
        assert_eq!(parse_model_json(&raw).expect("parse"), ambush());
    }

    #[test]
    fn dirty_json_is_repaired() {
        let raw = "{title: 'Ambush', content: \"The party was ambushed at the bridge.\", keywords: ['bridge', 'ambush',],}";
        assert_eq!(parse_model_json(raw).expect("parse"), ambush());

        let smart = "{“title”: “Ambush”, “content”: “The party was ambushed at the bridge.”, “keywords”: [“bridge”, “ambush”]}";
        assert_eq!(parse_model_json(smart).expect("parse"), ambush());
    }

    #[test]
    fn raw_newlines_inside_strings_are_escaped() {
        let raw = "{\"title\": \"Ambush\", \"content\": \"The party was ambushed\nat the bridge.\", \"keywords\": []}";
        let parsed = parse_model_json(raw).expect("parse");
        assert_eq!(parsed.content, "The party was ambushed\nat the bridge.");
    }

    #[test]
    fn content_synonyms_are_accepted_and_keywords_cleaned() {
        let raw = r#"{"title":" Ambush ","summary":"  Short.  ","keywords":[" a ", "", 3, "b"]}"#;
        let parsed = parse_model_json(raw).expect("parse");
        assert_eq!(parsed.title, "Ambush");
        assert_eq!(parsed.content, "Short.");
        assert_eq!(parsed.keywords, vec!["a", "b"]);
    }

    #[test]
    fn prose_only_is_no_json_block_and_recoverable() {
        let err = parse_model_json("I'm sorry, I can't summarize this scene.").expect_err("prose");
        assert_eq!(err.code, AiErrorCode::NoJsonBlock);
        assert!(err.recoverable);
        assert_eq!(err.raw, "I'm sorry, I can't summarize this scene.");
    }

    #[test]
    fn every_truncation_of_valid_json_is_unbalanced() {
        for cut in 1..VALID.len() - 1 {
            let prefix = &VALID[..cut];
            let err = parse_model_json(prefix).expect_err("truncated must fail");
            assert_eq!(err.code, AiErrorCode::Unbalanced, "prefix {prefix:?}");
            assert!(!err.recoverable);
        }
    }

    #[test]
    fn odd_quote_count_is_unbalanced() {
        let err = parse_model_json(r#"{"title": "Ambush", "content": "cut off"#).expect_err("fail");
        assert_eq!(err.code, AiErrorCode::Unbalanced);
        assert!(likely_unbalanced(r#"{"a": "b}"#));
        assert!(likely_unbalanced("}{"));
        assert!(!likely_unbalanced(r#"{"a": "\"}"}"#));
    }

    #[test]
    fn missing_fields_are_classified() {
        let no_title = parse_model_json(r#"{"content":"x.","keywords":[]}"#).expect_err("title");
        assert_eq!(no_title.code, AiErrorCode::MissingFieldsTitle);
        let no_content = parse_model_json(r#"{"title":"x","keywords":[]}"#).expect_err("content");
        assert_eq!(no_content.code, AiErrorCode::MissingFieldsContent);
        let bad_keywords =
            parse_model_json(r#"{"title":"x","content":"y.","keywords":"a,b"}"#).expect_err("kw");
        assert_eq!(bad_keywords.code, AiErrorCode::InvalidKeywords);
    }

    #[test]
    fn long_unterminated_prose_with_braces_is_incomplete_sentence() {
        let raw = "Here is what happened in the scene {not json} and then the characters walked toward the old mill while";
        let err = parse_model_json(raw).expect_err("fail");
        assert_eq!(err.code, AiErrorCode::IncompleteSentence);
    }

    #[test]
    fn balanced_garbage_is_malformed() {
        let err = parse_model_json("{this is not: json at all ;; }").expect_err("fail");
        assert_eq!(err.code, AiErrorCode::Malformed);
    }

    #[test]
    fn control_and_zero_width_characters_are_removed() {
        let raw = format!("\u{FEFF}\u{200B}{}\u{0007}\r\n", VALID);
        assert_eq!(parse_model_json(&raw).expect("parse"), ambush());
        assert_eq!(normalize_text("a\r\nb\u{2060}\tc"), "a\nb\tc");
    }

    #[test]
    fn fenced_blocks_are_listed_in_order() {
        let text = "```json\n{\"a\":1}\n```\nthen\n```\n[2]\n```\n```unterminated";
        assert_eq!(extract_fenced_blocks(text), vec!["{\"a\":1}", "[2]"]);
    }

    #[test]
    fn balanced_extractor_ignores_braces_in_strings() {
        let text = r#"pre {"a": "}{", "b": [1, {"c": 2}]} post"#;
        assert_eq!(
            extract_balanced_json(text).as_deref(),
            Some(r#"{"a": "}{", "b": [1, {"c": 2}]}"#)
        );
        assert_eq!(extract_balanced_json("{ open"), None);
    }

    #[test]
    fn ends_nicely_rules() {
        assert!(ends_nicely(""));
        assert!(ends_nicely("short and unterminated"));
        assert!(ends_nicely(&format!("{}.\"", "x".repeat(100))));
        assert!(!ends_nicely(&"x".repeat(100)));
    }

    #[test]
    fn unwrap_envelope_handles_known_shapes() {
        let claude = json!({"content": [{"type": "text", "text": "hello"}, {"type": "tool_use"}]});
        assert_eq!(unwrap_envelope(&claude).expect("claude"), "hello");

        let gemini = json!({"candidates": [{"content": {"parts": [{"text": "a"}, {"text": "b"}]}}]});
        assert_eq!(unwrap_envelope(&gemini).expect("gemini"), "ab");

        let plain = json!({"content": "plain"});
        assert_eq!(unwrap_envelope(&plain).expect("plain"), "plain");

        let empty = json!({"content": [{"type": "image"}]});
        assert_eq!(
            unwrap_envelope(&empty).expect_err("empty").code,
            AiErrorCode::EmptyOrInvalid
        );
    }

    #[test]
    fn arc_json_parses_members_and_unassigned() {
        let raw = r#"```json
{"arcs":[{"title":"Bridge Saga","summary":"It all went wrong.","keywords":["bridge"],"member_ids":["001", 2]},
         {"title":"", "summary":"dropped"}],
 "unassigned_memories":[{"id":"003"}, "4"]}
```"#;
        let parsed = parse_arc_json(raw).expect("arcs");
        assert_eq!(parsed.arcs.len(), 1);
        assert_eq!(
            parsed.arcs[0].member_ids,
            Some(vec!["001".to_string(), "2".to_string()])
        );
        assert_eq!(parsed.unassigned, vec!["003", "4"]);
    }

    #[test]
    fn arc_json_without_arcs_key_is_malformed() {
        let err = parse_arc_json(r#"{"groups": []}"#).expect_err("fail");
        assert_eq!(err.code, AiErrorCode::Malformed);
    }
}
