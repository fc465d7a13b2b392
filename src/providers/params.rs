//! Custom parameter merge engine.
//!
//! A channel may carry a JSON spec such as
//!
//! ```json
//! {"overwrite": false, "per_model": true,
//!  "gemini-2.5-pro": {"remove_params": ["generationConfig.thinkingConfig"],
//!                     "generationConfig": {"temperature": 0.2}}}
//! ```
//!
//! `per_model` scopes the spec to the exact upstream model id, `remove_params`
//! deletes dotted paths before merging, and `overwrite` chooses between
//! replacing keys outright and deep-merging object values.

use crate::error::{RelayError, Result};
use crate::raw::{is_object, RawObject};
use bytes::Bytes;
use serde_json::value::RawValue;
use serde_json::{Map, Value};

/// Keys that steer the merge and are never copied into the body.
const CONTROL_KEYS: [&str; 5] = ["stream", "overwrite", "per_model", "remove_params", "pre_add"];

fn flag(spec: &Map<String, Value>, key: &str) -> bool {
    spec.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn remove_paths(spec: &Map<String, Value>) -> Vec<&str> {
    spec.get("remove_params")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn mergeable(spec: &Map<String, Value>) -> impl Iterator<Item = (&String, &Value)> {
    spec.iter()
        .filter(|(k, _)| !CONTROL_KEYS.contains(&k.as_str()))
}

/// Merge a channel's custom parameters into a parsed request body.
pub fn merge_custom_params(
    mut body: Map<String, Value>,
    spec: &Map<String, Value>,
    model: &str,
) -> Map<String, Value> {
    let overwrite = flag(spec, "overwrite");
    let empty = Map::new();

    let scoped = if flag(spec, "per_model") && !model.is_empty() {
        spec.get(model).and_then(Value::as_object).unwrap_or(&empty)
    } else {
        spec
    };

    for path in remove_paths(scoped) {
        remove_nested(&mut body, path);
    }

    for (key, value) in mergeable(scoped) {
        if overwrite {
            body.insert(key.clone(), value.clone());
            continue;
        }
        match body.get_mut(key) {
            Some(Value::Object(existing)) => {
                if let Value::Object(incoming) = value {
                    deep_merge(existing, incoming);
                }
            }
            // Present but not mergeable: the client's value stands.
            Some(_) => {}
            None => {
                body.insert(key.clone(), value.clone());
            }
        }
    }

    body
}

/// Recursive merge where incoming values win except when both sides are objects.
pub fn deep_merge(existing: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        match (existing.get_mut(key), value) {
            (Some(Value::Object(current)), Value::Object(next)) => deep_merge(current, next),
            _ => {
                existing.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Delete a dotted path such as `generationConfig.thinkingConfig`.
/// Missing or non-object intermediate segments leave the body untouched.
pub fn remove_nested(body: &mut Map<String, Value>, path: &str) -> bool {
    let mut segments = path.split('.').peekable();
    let mut current = body;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            return current.remove(segment).is_some();
        }
        match current.get_mut(segment) {
            Some(Value::Object(next)) => current = next,
            _ => return false,
        }
    }
    false
}

/// Same semantics as [`merge_custom_params`] applied to serialized bytes.
///
/// Only the top-level keys named by the spec are decoded; everything else is
/// copied through as raw JSON. With `per_model` and no matching object the
/// body is returned unchanged.
pub fn merge_custom_params_bytes(
    body: Bytes,
    spec: &Map<String, Value>,
    model: &str,
) -> Result<Bytes> {
    let overwrite = flag(spec, "overwrite");

    let scoped = if flag(spec, "per_model") && !model.is_empty() {
        match spec.get(model).and_then(Value::as_object) {
            Some(scoped) => scoped,
            None => return Ok(body),
        }
    } else {
        spec
    };

    let mut top = RawObject::parse(&body).map_err(|e| {
        RelayError::internal("merge_custom_params_bytes_failed", format!("invalid body: {e}"))
    })?;
    let mut dirty = false;

    for path in remove_paths(scoped) {
        dirty |= remove_nested_raw(&mut top, path)?;
    }

    for (key, value) in mergeable(scoped) {
        let replacement = match top.get(key) {
            _ if overwrite => Some(value.clone()),
            None => Some(value.clone()),
            Some(existing) if is_object(existing) && value.is_object() => {
                let mut current: Map<String, Value> = serde_json::from_str(existing.get())?;
                if let Value::Object(incoming) = value {
                    deep_merge(&mut current, incoming);
                }
                Some(Value::Object(current))
            }
            Some(_) => None,
        };
        if let Some(replacement) = replacement {
            top.set(key, serde_json::value::to_raw_value(&replacement)?);
            dirty = true;
        }
    }

    if !dirty {
        return Ok(body);
    }
    Ok(Bytes::from(top.to_vec()?))
}

fn remove_nested_raw(top: &mut RawObject<'_>, path: &str) -> Result<bool> {
    let Some((head, rest)) = path.split_once('.') else {
        return Ok(top.remove(path));
    };
    let Some(subtree) = top.get(head).filter(|v| is_object(v)) else {
        return Ok(false);
    };
    let mut inner: Map<String, Value> = serde_json::from_str(subtree.get())?;
    if !remove_nested(&mut inner, rest) {
        return Ok(false);
    }
    let encoded: Box<RawValue> = serde_json::value::to_raw_value(&inner)?;
    top.set(head, encoded);
    Ok(true)
}
