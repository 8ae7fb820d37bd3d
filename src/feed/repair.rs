//! Best-effort repair of structurally broken feed files.
//!
//! The upstream scraper occasionally emits a bare sequence of JSON objects:
//! no enclosing array brackets and no commas between adjacent objects. This
//! module fixes exactly those two defects and nothing else; anything still
//! unparseable afterwards is the caller's problem (treated as an empty feed).

use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

static OBJECT_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\}\s*\{").expect("static regex"));

/// Repair a raw feed document so it parses as a single JSON array.
pub fn repair(raw: &str) -> Cow<'_, str> {
    let trimmed = raw.trim();

    let needs_open = !trimmed.starts_with('[');
    let needs_close = !trimmed.ends_with(']');
    let needs_commas = OBJECT_BOUNDARY.is_match(trimmed);

    if !needs_open && !needs_close && !needs_commas {
        return Cow::Borrowed(raw);
    }

    let mut repaired = String::with_capacity(trimmed.len() + 2);
    if needs_open {
        repaired.push('[');
    }
    repaired.push_str(&OBJECT_BOUNDARY.replace_all(trimmed, "},{"));
    if needs_close {
        repaired.push(']');
    }
    Cow::Owned(repaired)
}
