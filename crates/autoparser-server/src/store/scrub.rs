//! NUL removal for stored text
//!
//! PostgreSQL rejects `\0` in TEXT columns and `\u0000` in JSONB. Fetched pages
//! (PDFs in particular) and extractor replies can carry it, so both stores drop
//! the character before writing. Values without it are passed through borrowed.

use serde_json::{Map, Value};
use std::borrow::Cow;

const NUL: char = '\0';

pub fn text(s: &str) -> Cow<'_, str> {
    if s.contains(NUL) {
        Cow::Owned(s.replace(NUL, ""))
    } else {
        Cow::Borrowed(s)
    }
}

pub fn opt_text(s: Option<&str>) -> Option<Cow<'_, str>> {
    s.map(text)
}

/// Strip NUL from every string and object key in `value`
pub fn json(value: &Value) -> Cow<'_, Value> {
    if has_nul(value) {
        Cow::Owned(strip(value))
    } else {
        Cow::Borrowed(value)
    }
}

fn has_nul(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains(NUL),
        Value::Array(items) => items.iter().any(has_nul),
        Value::Object(map) => map.iter().any(|(k, v)| k.contains(NUL) || has_nul(v)),
        _ => false,
    }
}

fn strip(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace(NUL, "")),
        Value::Array(items) => Value::Array(items.iter().map(strip).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.replace(NUL, ""), strip(v)))
                .collect::<Map<_, _>>(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_without_nul_is_borrowed() {
        assert!(matches!(text("Грант"), Cow::Borrowed("Грант")));
        assert_eq!(text("%PDF-1.4\0\0obj"), "%PDF-1.4obj");
    }

    #[test]
    fn test_json_strips_nested_strings_and_keys() {
        let value = json!({
            "msr_summary": "a\u{0}b",
            "list": ["x\u{0}", 1, null],
            "k\u{0}ey": { "inner": "\u{0}" }
        });
        assert_eq!(
            json(&value).into_owned(),
            json!({
                "msr_summary": "ab",
                "list": ["x", 1, null],
                "key": { "inner": "" }
            })
        );
    }

    #[test]
    fn test_clean_json_is_borrowed() {
        let value = json!({ "msr_name": "Грант", "amount": 300000 });
        assert!(matches!(json(&value), Cow::Borrowed(_)));
    }
}
