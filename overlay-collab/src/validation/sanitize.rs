//! Output-safety transforms applied after a payload passes its schema.

use serde_json::Value;

use super::schema::{FieldKind, Schema};

/// Encode the characters that are significant in HTML.
pub fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            _ => out.push(c),
        }
    }
    out
}

/// Truncate to `max` characters, then escape. Truncating first keeps
/// entities whole.
pub fn clean_text(input: &str, max: usize) -> String {
    let truncated: String = input.chars().take(max).collect();
    html_escape(&truncated)
}

/// Parse and normalize a URL. Only http and https are kept.
pub fn safe_url(input: &str) -> Option<String> {
    let parsed = url::Url::parse(input.trim()).ok()?;
    match parsed.scheme() {
        "http" | "https" => Some(parsed.to_string()),
        _ => None,
    }
}

/// Sanitize a schema-checked payload in place.
pub fn sanitize(schema: &Schema, payload: &mut Value) {
    sanitize_record(schema, payload);
}

fn sanitize_record(schema: &Schema, value: &mut Value) {
    let Some(object) = value.as_object_mut() else {
        return;
    };
    for field in &schema.fields {
        let keep = match object.get_mut(field.name) {
            Some(v) => sanitize_value(&field.kind, v),
            None => true,
        };
        if !keep {
            log::debug!("Removed unsafe value for '{}'", field.name);
            object.remove(field.name);
        }
    }
}

/// Returns `false` when the value must be dropped.
fn sanitize_value(kind: &FieldKind, value: &mut Value) -> bool {
    match kind {
        FieldKind::Text {
            max,
            free_text: true,
        } => {
            if let Some(s) = value.as_str() {
                *value = Value::String(clean_text(s, *max));
            }
            true
        }
        FieldKind::Url => match value.as_str().and_then(safe_url) {
            Some(url) => {
                *value = Value::String(url);
                true
            }
            None => false,
        },
        FieldKind::Array { item, .. } => {
            if let Some(items) = value.as_array_mut() {
                items.retain_mut(|v| sanitize_value(item, v));
            }
            true
        }
        FieldKind::Record(schema) => {
            sanitize_record(schema, value);
            true
        }
        _ => true,
    }
}
