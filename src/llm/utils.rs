use regex::Regex;
use std::sync::LazyLock;

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s{0,3}#{1,6}\s*").expect("valid regex"));
static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:[-*+]|\d+\.)\s+").expect("valid regex"));
static EMPHASIS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*|__|`").expect("valid regex"));

/// Cuts a model reply down to its JSON payload, dropping code fences and chatter
/// before the first `{`/`[` and after the last `}`/`]`.
pub fn clean_json_output(raw: &str) -> &str {
    let start = raw.find(['{', '[']);
    let end = raw.rfind(['}', ']']);
    match (start, end) {
        (Some(s), Some(e)) if e >= s => &raw[s..=e],
        _ => raw.trim(),
    }
}

/// Removes markdown headings, list markers and emphasis from narrative text.
pub fn strip_markdown_noise(text: &str) -> String {
    let text = HEADING_RE.replace_all(text, "");
    let text = BULLET_RE.replace_all(&text, "");
    let text = EMPHASIS_RE.replace_all(&text, "");
    text.trim().to_string()
}
