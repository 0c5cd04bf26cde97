//! Post-processing of extracted report data.
//!
//! `sanitize` runs before anything is written: Postgres text columns reject
//! NUL bytes and some PDFs carry them. `normalize_keys` and `clean_values`
//! only shape data for display and never touch the stored payload.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::path::Path;
use tokio::io::AsyncReadExt;

pub const PDF_MAGIC: &[u8] = b"%PDF";

pub async fn is_valid_pdf(path: &Path) -> bool {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return false;
    };
    let mut head = [0u8; 4];
    match file.read_exact(&mut head).await {
        Ok(_) => head == PDF_MAGIC,
        Err(_) => false,
    }
}

/// Strips NUL from string values, leaving keys alone.
pub fn remove_null_chars(value: Value) -> Value {
    map_strings(value, &|s| s.replace('\0', ""), false)
}

/// Strips NUL from keys and string values at every depth.
pub fn sanitize(value: Value) -> Value {
    map_strings(value, &|s| s.replace('\0', ""), true)
}

/// Lower-cases keys and turns whitespace runs into `_`.
pub fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_keys).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, value)| (normalize_key(&key), normalize_keys(value)))
                .collect(),
        ),
        other => other,
    }
}

pub fn normalize_key(key: &str) -> String {
    static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
    SPACES.replace_all(&key.to_lowercase(), "_").into_owned()
}

static REPLACEMENTS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)no records\s*found", "No records found"),
        (r"(?i)yes", "Yes"),
        (r"(?i)not available", "Not available"),
        (r"(?i)not installed", "Not installed"),
        (r"\s+", " "),
        ("대한민국", "KR"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (Regex::new(pattern).expect("valid regex"), replacement))
    .collect()
});

/// Canonicalizes common phrases, collapses whitespace and maps the Korean
/// country name to `KR` in every string leaf.
pub fn clean_values(value: Value) -> Value {
    map_strings(value, &clean_text, false)
}

fn clean_text(text: &str) -> String {
    let cleaned = REPLACEMENTS
        .iter()
        .fold(text.to_string(), |acc, (pattern, replacement)| {
            pattern.replace_all(&acc, *replacement).into_owned()
        });
    cleaned.trim().to_string()
}

fn map_strings(value: Value, f: &dyn Fn(&str) -> String, keys: bool) -> Value {
    match value {
        Value::String(s) => Value::String(f(&s)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| map_strings(v, f, keys))
                .collect(),
        ),
        Value::Object(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (key, value) in fields {
                let key = if keys { f(&key) } else { key };
                out.insert(key, map_strings(value, f, keys));
            }
            Value::Object(out)
        }
        other => other,
    }
}

const VEHICLE_KEYS: &[&str] = &["vin", "model", "make", "brand", "vehicle"];

/// True when the payload names a vehicle and a year somewhere in its keys.
pub fn has_vehicle_fields(value: &Value) -> bool {
    let mut vehicle = false;
    let mut year = false;
    visit_keys(value, &mut |key| {
        let key = normalize_key(key);
        if VEHICLE_KEYS.iter().any(|k| {
            key == *k || key.starts_with(&format!("{k}_")) || key.ends_with(&format!("_{k}"))
        }) {
            vehicle = true;
        }
        if key.contains("year") {
            year = true;
        }
    });
    vehicle && year
}

fn visit_keys(value: &Value, visit: &mut dyn FnMut(&str)) {
    match value {
        Value::Object(fields) => {
            for (key, value) in fields {
                visit(key);
                visit_keys(value, visit);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| visit_keys(v, visit)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contains_nul(value: &Value) -> bool {
        match value {
            Value::String(s) => s.contains('\0'),
            Value::Array(items) => items.iter().any(contains_nul),
            Value::Object(fields) => fields
                .iter()
                .any(|(k, v)| k.contains('\0') || contains_nul(v)),
            _ => false,
        }
    }

    #[test]
    fn sanitize_removes_every_nul_and_keeps_shape() {
        let input = json!({
            "mo\u{0}del": "Sonata\u{0}",
            "owners": [{"name": "\u{0}Kim", "count": 2}],
            "ok": true,
        });
        let out = sanitize(remove_null_chars(input));
        assert!(!contains_nul(&out));
        assert_eq!(
            out,
            json!({"model": "Sonata", "owners": [{"name": "Kim", "count": 2}], "ok": true})
        );
    }

    #[test]
    fn remove_null_chars_leaves_keys() {
        let out = remove_null_chars(json!({"a\u{0}": "b\u{0}"}));
        assert_eq!(out, json!({"a\u{0}": "b"}));
    }

    #[test]
    fn keys_are_lowercased_and_underscored() {
        let out = normalize_keys(json!({"Vehicle Specifications": {"Engine  Capacity": "1.6"}}));
        assert_eq!(out, json!({"vehicle_specifications": {"engine_capacity": "1.6"}}));
    }

    #[test]
    fn values_are_canonicalized() {
        let out = clean_values(json!({
            "records": "no recordsfound",
            "country": " 대한민국 ",
            "abs": "YES",
            "lane":  "not   INSTALLED",
        }));
        assert_eq!(out["records"], "No records found");
        assert_eq!(out["country"], "KR");
        assert_eq!(out["abs"], "Yes");
        assert_eq!(out["lane"], "Not installed");
    }

    #[test]
    fn vehicle_fields_need_vehicle_and_year() {
        assert!(has_vehicle_fields(&json!({"Model": "Sonata", "Year": "2016"})));
        assert!(has_vehicle_fields(&json!({"vehicle_specifications": {"model_year": 2016}})));
        assert!(!has_vehicle_fields(&json!({"invoice_number": "1", "total": 10})));
        assert!(!has_vehicle_fields(&json!({"vin": "KMH"})));
    }

    #[tokio::test]
    async fn pdf_magic_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("ok.pdf");
        let json = dir.path().join("bad.pdf");
        tokio::fs::write(&pdf, b"%PDF-1.4\n").await.unwrap();
        tokio::fs::write(&json, b"JSON{}").await.unwrap();
        assert!(is_valid_pdf(&pdf).await);
        assert!(!is_valid_pdf(&json).await);
        assert!(!is_valid_pdf(&dir.path().join("missing.pdf")).await);
    }
}
