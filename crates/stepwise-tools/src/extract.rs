use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use stepwise_core::reference::{parse_path, walk, Segment};
use stepwise_core::schema::{Extractor, ToolSchema};
use stepwise_core::types::Payload;

/// Named outputs pulled from one raw payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub fields: Map<String, Value>,
    /// Unclaimed top-level keys, kept only when the schema allows dynamic output.
    pub dynamic: Map<String, Value>,
}

/// Apply every extractor the schema declares to `payload`.
///
/// An extractor with nothing to read leaves its field absent; resolution
/// then treats references to it as unresolved.
pub fn extract(schema: &ToolSchema, payload: &Payload) -> Extracted {
    let mut out = Extracted::default();
    for output in &schema.outputs {
        match apply(&output.extractor, payload) {
            Some(value) => {
                out.fields.insert(output.name.clone(), value);
            }
            None => debug!(
                tool = %schema.tool,
                field = %output.name,
                kind = payload.kind(),
                "Extractor found nothing"
            ),
        }
    }
    if schema.allow_dynamic {
        out.dynamic = unclaimed(schema, payload, &out.fields);
    }
    out
}

fn apply(extractor: &Extractor, payload: &Payload) -> Option<Value> {
    match extractor {
        Extractor::Urls => Some(Value::Array(
            urls_in(payload).into_iter().map(Value::String).collect(),
        )),
        Extractor::Path { path } => {
            let segments = parse_path(path).ok()?;
            match payload {
                Payload::Text(_) | Payload::RecordList(_) => None,
                Payload::Record(map) | Payload::StructuredMap(map) => {
                    let (first, rest) = segments.split_first()?;
                    let root = match first {
                        Segment::Key(k) => map.get(k)?,
                        Segment::Index(_) => return None,
                    };
                    walk(root, rest).cloned()
                }
            }
        }
        Extractor::Records => {
            payload.record_count()?;
            Some(Value::Array(
                payload
                    .records()
                    .into_iter()
                    .cloned()
                    .map(Value::Object)
                    .collect(),
            ))
        }
        Extractor::Pluck { field } => {
            payload.record_count()?;
            Some(Value::Array(
                payload
                    .records()
                    .into_iter()
                    .filter_map(|r| r.get(field).cloned())
                    .collect(),
            ))
        }
        Extractor::Text => payload.text().map(|t| Value::String(t.to_string())),
        Extractor::Count => payload.record_count().map(|n| Value::from(n as u64)),
        Extractor::Regex { pattern, group } => {
            let re = match Regex::new(pattern) {
                Ok(re) => re,
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Invalid extractor regex");
                    return None;
                }
            };
            let mut matches = Vec::new();
            for text in strings_in(payload) {
                for caps in re.captures_iter(&text) {
                    if let Some(m) = caps.get(*group) {
                        matches.push(Value::String(m.as_str().to_string()));
                    }
                }
            }
            Some(Value::Array(matches))
        }
    }
}

/// Top-level payload keys no extractor consumed, preserved verbatim.
fn unclaimed(
    schema: &ToolSchema,
    payload: &Payload,
    fields: &Map<String, Value>,
) -> Map<String, Value> {
    let claims_records = schema
        .outputs
        .iter()
        .any(|o| matches!(o.extractor, Extractor::Records));
    let claims_text = schema
        .outputs
        .iter()
        .any(|o| matches!(o.extractor, Extractor::Text));

    let mut dynamic = Map::new();
    match payload {
        Payload::Text(text) => {
            if !claims_text {
                dynamic.insert("text".into(), Value::String(text.clone()));
            }
        }
        Payload::RecordList(_) => {
            if !claims_records {
                let records = apply(&Extractor::Records, payload).unwrap_or(Value::Null);
                dynamic.insert("records".into(), records);
            }
        }
        Payload::Record(map) | Payload::StructuredMap(map) => {
            let claimed: Vec<&str> = schema
                .outputs
                .iter()
                .filter_map(|o| o.extractor.claimed_key())
                .collect();
            for (key, value) in map {
                if claimed.contains(&key.as_str()) || fields.contains_key(key) {
                    continue;
                }
                dynamic.insert(key.clone(), value.clone());
            }
        }
    }
    dynamic
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"'()\[\]{}]+"#).expect("url regex is valid"))
}

/// Distinct http(s) URLs in every string of the payload, in order of appearance.
pub fn urls_in(payload: &Payload) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for text in strings_in(payload) {
        for m in url_regex().find_iter(&text) {
            let url = m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']);
            if !urls.iter().any(|u| u == url) {
                urls.push(url.to_string());
            }
        }
    }
    urls
}

fn strings_in(payload: &Payload) -> Vec<String> {
    let mut out = Vec::new();
    collect_strings(&payload.to_value(), &mut out);
    out
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}
