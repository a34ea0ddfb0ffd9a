//! Raw dump/API records to normalized [`Entity`] values.
//!
//! Decoding is pure: the write timestamp and provenance come in through
//! [`DecodeContext`], so identical bytes always produce identical entities.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::domain::{Claims, Entity, EntityId, EntityKind, Source, to_stored_precision};
use crate::error::MirrorError;

#[derive(Debug, Clone, Copy)]
pub struct DecodeContext {
    pub source: Source,
    pub fetched_at: DateTime<Utc>,
}

impl DecodeContext {
    pub fn new(source: Source, fetched_at: DateTime<Utc>) -> Self {
        Self {
            source,
            fetched_at: to_stored_precision(fetched_at),
        }
    }
}

/// Result of decoding a remote API response for one id.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiPayload {
    Entity(Entity),
    Missing,
}

/// Decode one dump line.
///
/// Dump lines are elements of one big JSON array, so surrounding whitespace
/// and a trailing comma are accepted.
pub fn decode_record(bytes: &[u8], ctx: &DecodeContext) -> Result<Entity, MirrorError> {
    let trimmed = trim_record(bytes);
    if trimmed.is_empty() {
        return Err(MirrorError::Decode("empty record".to_string()));
    }
    let value: Value = serde_json::from_slice(trimmed)
        .map_err(|err| MirrorError::Decode(format!("malformed JSON: {err}")))?;
    match value {
        Value::Object(object) => decode_object(object, ctx),
        other => Err(MirrorError::Decode(format!(
            "record is not a JSON object (found {})",
            json_type(&other)
        ))),
    }
}

/// Decode a `wbgetentities` / `Special:EntityData` response for `requested`.
pub fn decode_api_payload(
    requested: &EntityId,
    bytes: &[u8],
    ctx: &DecodeContext,
) -> Result<ApiPayload, MirrorError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|err| MirrorError::Decode(format!("malformed API response: {err}")))?;
    let Value::Object(mut root) = value else {
        return Err(MirrorError::Decode(
            "API response is not a JSON object".to_string(),
        ));
    };

    if let Some(error) = root.get("error") {
        let code = error.get("code").and_then(Value::as_str).unwrap_or("");
        if code == "no-such-entity" {
            return Ok(ApiPayload::Missing);
        }
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown API error");
        return Err(MirrorError::Decode(format!("API error {code}: {info}")));
    }

    let Some(Value::Object(mut entities)) = root.remove("entities") else {
        return Err(MirrorError::Decode(
            "API response has no entities object".to_string(),
        ));
    };

    // A redirected id comes back keyed by its target.
    let entry = match entities.remove(requested.as_str()) {
        Some(entry) => entry,
        None if entities.len() == 1 => match entities.into_iter().next() {
            Some((_, entry)) => entry,
            None => return Ok(ApiPayload::Missing),
        },
        None => return Ok(ApiPayload::Missing),
    };

    let Value::Object(object) = entry else {
        return Err(MirrorError::Decode(format!(
            "entity {requested} is not a JSON object"
        )));
    };
    if object.contains_key("missing") {
        return Ok(ApiPayload::Missing);
    }
    decode_object(object, ctx).map(ApiPayload::Entity)
}

fn decode_object(mut object: Map<String, Value>, ctx: &DecodeContext) -> Result<Entity, MirrorError> {
    let id = match object.remove("id") {
        Some(Value::String(raw)) => raw
            .parse::<EntityId>()
            .map_err(|_| MirrorError::Decode(format!("invalid id: {raw}")))?,
        Some(other) => {
            return Err(MirrorError::Decode(format!(
                "id must be a string (found {})",
                json_type(&other)
            )));
        }
        None => return Err(MirrorError::Decode("missing required field: id".to_string())),
    };

    let kind = match object.remove("type") {
        Some(Value::String(raw)) => raw
            .parse::<EntityKind>()
            .map_err(|err| MirrorError::Decode(format!("{id}: {err}")))?,
        Some(other) => {
            return Err(MirrorError::Decode(format!(
                "{id}: type must be a string (found {})",
                json_type(&other)
            )));
        }
        None => {
            return Err(MirrorError::Decode(format!(
                "{id}: missing required field: type"
            )));
        }
    };

    let labels = decode_terms(&id, "labels", object.remove("labels"))?;
    let descriptions = decode_terms(&id, "descriptions", object.remove("descriptions"))?;
    let aliases = decode_aliases(&id, object.remove("aliases"))?;
    let statements = decode_statements(&id, object.remove("claims"))?;

    let modified = match object.remove("modified") {
        Some(Value::String(modified)) => Some(modified),
        Some(other) => {
            object.insert("modified".to_string(), other);
            None
        }
        None => None,
    };

    Ok(Entity {
        id,
        kind,
        labels,
        descriptions,
        aliases,
        claims: Claims {
            statements,
            extra: object,
        },
        modified,
        fetched_at: ctx.fetched_at,
        source: ctx.source,
    })
}

/// Language map of `{"language": .., "value": ..}` objects or bare strings.
fn decode_terms(
    id: &EntityId,
    field: &str,
    value: Option<Value>,
) -> Result<BTreeMap<String, String>, MirrorError> {
    let mut terms = BTreeMap::new();
    for (language, term) in language_map(id, field, value)? {
        let text = term_value(&term).ok_or_else(|| {
            MirrorError::Decode(format!("{id}: {field}.{language} has no string value"))
        })?;
        terms.insert(language, text.to_string());
    }
    Ok(terms)
}

fn decode_aliases(
    id: &EntityId,
    value: Option<Value>,
) -> Result<BTreeMap<String, BTreeSet<String>>, MirrorError> {
    let mut aliases = BTreeMap::new();
    for (language, list) in language_map(id, "aliases", value)? {
        let Value::Array(items) = list else {
            return Err(MirrorError::Decode(format!(
                "{id}: aliases.{language} must be a list"
            )));
        };
        let mut set = BTreeSet::new();
        for item in &items {
            let text = term_value(item).ok_or_else(|| {
                MirrorError::Decode(format!("{id}: aliases.{language} has a non-string alias"))
            })?;
            set.insert(text.to_string());
        }
        if !set.is_empty() {
            aliases.insert(language, set);
        }
    }
    Ok(aliases)
}

fn decode_statements(
    id: &EntityId,
    value: Option<Value>,
) -> Result<Map<String, Value>, MirrorError> {
    language_map(id, "claims", value)
}

/// Upstream serializes empty maps as `[]`; both shapes decode to a map.
fn language_map(
    id: &EntityId,
    field: &str,
    value: Option<Value>,
) -> Result<Map<String, Value>, MirrorError> {
    match value {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(Value::Array(items)) if items.is_empty() => Ok(Map::new()),
        Some(other) => Err(MirrorError::Decode(format!(
            "{id}: {field} must be an object (found {})",
            json_type(&other)
        ))),
    }
}

fn term_value(term: &Value) -> Option<&str> {
    match term {
        Value::String(text) => Some(text),
        Value::Object(object) => object.get("value").and_then(Value::as_str),
        _ => None,
    }
}

fn trim_record(bytes: &[u8]) -> &[u8] {
    let trimmed = bytes.trim_ascii();
    let trimmed = trimmed.strip_suffix(b",").unwrap_or(trimmed);
    trimmed.trim_ascii_end()
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_record_strips_comma_and_whitespace() {
        assert_eq!(trim_record(b"  {\"a\":1},\n"), b"{\"a\":1}");
        assert_eq!(trim_record(b"{\"a\":1}"), b"{\"a\":1}");
        assert_eq!(trim_record(b" \n"), b"");
    }

    #[test]
    fn empty_array_maps_decode_as_empty() {
        let id: EntityId = "Q1".parse().unwrap();
        let map = language_map(&id, "labels", Some(Value::Array(Vec::new()))).unwrap();
        assert!(map.is_empty());
        assert!(language_map(&id, "labels", Some(Value::Array(vec![Value::Null]))).is_err());
    }
}
