use std::sync::LazyLock;

use regex::Regex;

static RE_UNSAFE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1F#]"#).unwrap());
static RE_MULTI_UNDERSCORE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_{2,}").unwrap());

/// Map an arbitrary room label to a safe single path segment.
///
/// Characters that are problematic in file names become `_`, runs of
/// underscores collapse to one, and leading/trailing underscores, spaces and
/// dots are trimmed. Never returns an empty string.
pub fn sanitize_filename(name: &str) -> String {
    let replaced = RE_UNSAFE.replace_all(name, "_");
    let collapsed = RE_MULTI_UNDERSCORE.replace_all(&replaced, "_");
    let trimmed = collapsed.trim_matches(|c| c == '_' || c == ' ' || c == '.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}
