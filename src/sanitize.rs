//! Structural repair of Gemini request bodies, applied to serialized bytes.
//!
//! Requests relayed to Gemini often carry base64 media in `inlineData`
//! parts. Everything here works on [`RawObject`] skeletons: only the objects
//! on the path to a change are decoded, media payloads are carried as raw
//! slices, and an untouched body comes back as the very same bytes.

use crate::error::{RelayError, Result};
use crate::raw::{is_object, parse_array, to_raw_array, RawObject};
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::{json, Map, Value};
use std::borrow::Cow;
use std::collections::HashMap;

const CALL_FIELDS: [&str; 2] = ["functionCall", "function_call"];
const RESPONSE_FIELDS: [&str; 2] = ["functionResponse", "function_response"];
const ID_FIELDS: [&str; 4] = [
    "functionCall",
    "function_call",
    "functionResponse",
    "function_response",
];
/// Hints some clients attach to tools; managed-identity endpoints reject them.
const CLIENT_TOOL_HINTS: [&str; 3] = ["tool_type", "toolType", "type"];

/// Run all repair passes over a serialized Gemini request.
///
/// Returns the input unchanged (borrowed) when no pass had anything to do,
/// so sanitizing twice is byte-identical to sanitizing once.
pub fn sanitize_gemini_request(input: &[u8], managed_identity: bool) -> Result<Cow<'_, [u8]>> {
    let mut top = RawObject::parse(input).map_err(malformed)?;
    let mut dirty = false;

    if let Some(contents) = repair_contents(&top)? {
        top.set("contents", contents);
        dirty = true;
    }

    match clean_tools(&top, managed_identity)? {
        ToolsOutcome::Unchanged => {}
        ToolsOutcome::Replace(tools) => {
            top.set("tools", tools);
            dirty = true;
        }
        ToolsOutcome::Remove => {
            top.remove("tools");
            dirty = true;
        }
    }

    if !dirty {
        return Ok(Cow::Borrowed(input));
    }
    Ok(Cow::Owned(top.to_vec().map_err(malformed)?))
}

fn malformed(e: serde_json::Error) -> RelayError {
    RelayError::translation("invalid_gemini_request", format!("malformed Gemini request: {e}"))
}

struct Turn<'c> {
    obj: RawObject<'c>,
    dirty: bool,
}

/// Passes 1 to 3. `Some` carries the re-encoded `contents` array.
fn repair_contents(top: &RawObject<'_>) -> Result<Option<Box<RawValue>>> {
    let Some(contents) = top.get("contents") else {
        return Ok(None);
    };
    if !contents.get().trim_start().starts_with('[') {
        return Ok(None);
    }

    let mut turns = parse_array(contents)
        .map_err(malformed)?
        .into_iter()
        .map(|raw| {
            RawObject::parse_raw(raw)
                .map(|obj| Turn { obj, dirty: false })
                .map_err(malformed)
        })
        .collect::<Result<Vec<_>>>()?;

    repair_pairing(&mut turns)?;
    strip_function_ids(&mut turns)?;
    default_roles(&mut turns);

    if !turns.iter().any(|t| t.dirty) {
        return Ok(None);
    }

    let encoded = turns
        .iter()
        .map(|t| t.obj.to_raw())
        .collect::<serde_json::Result<Vec<_>>>()
        .map_err(malformed)?;
    Ok(Some(to_raw_array(encoded.iter().map(|b| &**b)).map_err(malformed)?))
}

fn string_field(obj: &RawObject<'_>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(|v| serde_json::from_str::<String>(v.get()).ok())
}

#[derive(Deserialize)]
struct Named {
    #[serde(default)]
    name: Option<String>,
}

/// Names found under any of `fields`, one per present field.
fn names_in(part: &RawObject<'_>, fields: &[&str]) -> Vec<String> {
    fields
        .iter()
        .filter_map(|field| part.get(field))
        .filter_map(|v| serde_json::from_str::<Named>(v.get()).ok())
        .filter_map(|n| n.name)
        .filter(|n| !n.is_empty())
        .collect()
}

fn part_objects<'t>(turn: &'t RawObject<'_>) -> Result<Vec<RawObject<'t>>> {
    let Some(parts) = turn.get("parts") else {
        return Ok(Vec::new());
    };
    parse_array(parts)
        .map_err(malformed)?
        .into_iter()
        .filter(|p| is_object(p))
        .map(|p| RawObject::parse_raw(p).map_err(malformed))
        .collect()
}

fn frequencies(names: &[String]) -> HashMap<&str, usize> {
    let mut freq = HashMap::new();
    for name in names {
        *freq.entry(name.as_str()).or_insert(0) += 1;
    }
    freq
}

/// Pass 1: every model turn with function calls must be followed by a turn
/// answering exactly those calls.
fn repair_pairing(turns: &mut [Turn<'_>]) -> Result<()> {
    for i in 0..turns.len().saturating_sub(1) {
        if string_field(&turns[i].obj, "role").as_deref() != Some("model") {
            continue;
        }

        let mut calls = Vec::new();
        let mut call_style_snake = None;
        for part in part_objects(&turns[i].obj)? {
            for field in CALL_FIELDS {
                let found = names_in(&part, &[field]);
                if !found.is_empty() && call_style_snake.is_none() {
                    call_style_snake = Some(field == "function_call");
                }
                calls.extend(found);
            }
        }
        if calls.is_empty() {
            continue;
        }

        let next = &turns[i + 1].obj;
        if string_field(next, "role").as_deref() == Some("model") {
            continue;
        }

        let mut responses = Vec::new();
        for part in part_objects(next)? {
            responses.extend(names_in(&part, &RESPONSE_FIELDS));
        }
        if frequencies(&calls) == frequencies(&responses) {
            continue;
        }

        let Some(parts_raw) = next.get("parts") else {
            continue;
        };
        let parts: Vec<Value> = serde_json::from_str(parts_raw.get()).map_err(malformed)?;
        let fixed = reconcile_parts(parts, &calls, call_style_snake.unwrap_or(false));
        let encoded = serde_json::value::to_raw_value(&fixed).map_err(malformed)?;

        tracing::debug!(
            turn = i + 1,
            calls = calls.len(),
            responses = responses.len(),
            "Repaired function response turn"
        );
        turns[i + 1].obj.set("parts", encoded);
        turns[i + 1].dirty = true;
    }
    Ok(())
}

fn response_name(part: &Map<String, Value>) -> Option<&str> {
    RESPONSE_FIELDS
        .iter()
        .filter_map(|f| part.get(*f))
        .find_map(|r| r.get("name").and_then(Value::as_str))
}

/// Keep responses while their call count lasts, keep every other part, then
/// append empty responses for the calls still unanswered, in call order.
fn reconcile_parts(parts: Vec<Value>, calls: &[String], call_style_snake: bool) -> Vec<Value> {
    let mut remaining: HashMap<&str, usize> = frequencies(calls);
    let mut fixed = Vec::with_capacity(parts.len() + calls.len());

    for part in parts {
        let name = part.as_object().and_then(response_name).map(str::to_owned);
        match name {
            Some(name) => match remaining.get_mut(name.as_str()) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    fixed.push(part);
                }
                _ => {}
            },
            None => fixed.push(part),
        }
    }

    let field = response_field_style(&fixed).unwrap_or(if call_style_snake {
        "function_response"
    } else {
        "functionResponse"
    });

    for call in calls {
        if let Some(left) = remaining.get_mut(call.as_str()) {
            if *left > 0 {
                *left -= 1;
                fixed.push(json!({ field: { "name": call, "response": { "output": "" } } }));
            }
        }
    }
    fixed
}

/// The field name used by the first existing response part, if any.
fn response_field_style(parts: &[Value]) -> Option<&'static str> {
    parts.iter().filter_map(Value::as_object).find_map(|p| {
        if p.contains_key("functionResponse") {
            Some("functionResponse")
        } else if p.contains_key("function_response") {
            Some("function_response")
        } else {
            None
        }
    })
}

/// Pass 2: drop `id` from call and response parts. All paths are collected
/// before any turn is rewritten.
fn strip_function_ids(turns: &mut [Turn<'_>]) -> Result<()> {
    let mut paths: Vec<(usize, usize, &'static str)> = Vec::new();
    for (t, turn) in turns.iter().enumerate() {
        let Some(parts) = turn.obj.get("parts") else {
            continue;
        };
        for (p, part) in parse_array(parts).map_err(malformed)?.into_iter().enumerate() {
            if !is_object(part) {
                continue;
            }
            let part = RawObject::parse_raw(part).map_err(malformed)?;
            for field in ID_FIELDS {
                if let Some(inner) = part.get(field).filter(|v| is_object(v)) {
                    if RawObject::parse_raw(inner).map_err(malformed)?.contains_key("id") {
                        paths.push((t, p, field));
                    }
                }
            }
        }
    }

    let mut idx = 0;
    while idx < paths.len() {
        let t = paths[idx].0;
        let end = paths[idx..]
            .iter()
            .position(|(turn, _, _)| *turn != t)
            .map_or(paths.len(), |off| idx + off);
        let encoded = rewrite_parts(&turns[t].obj, &paths[idx..end])?;
        turns[t].obj.set("parts", encoded);
        turns[t].dirty = true;
        idx = end;
    }
    Ok(())
}

fn rewrite_parts(turn: &RawObject<'_>, paths: &[(usize, usize, &str)]) -> Result<Box<RawValue>> {
    let parts_raw = turn
        .get("parts")
        .ok_or_else(|| RelayError::internal("sanitize_path_missing", "parts vanished"))?;
    let mut parts: Vec<Cow<'_, RawValue>> = parse_array(parts_raw)
        .map_err(malformed)?
        .into_iter()
        .map(Cow::Borrowed)
        .collect();

    for (_, p, field) in paths {
        let encoded = {
            let mut part = RawObject::parse_raw(&parts[*p]).map_err(malformed)?;
            let stripped = match part.get(field) {
                Some(inner) => {
                    let mut inner = RawObject::parse_raw(inner).map_err(malformed)?;
                    inner.remove("id");
                    inner.to_raw().map_err(malformed)?
                }
                None => continue,
            };
            part.set(field, stripped);
            part.to_raw().map_err(malformed)?
        };
        parts[*p] = Cow::Owned(encoded);
    }

    to_raw_array(parts.iter().map(|c| &**c)).map_err(malformed)
}

/// Pass 3.
fn default_roles(turns: &mut [Turn<'_>]) {
    for turn in turns.iter_mut() {
        if !turn.obj.contains_key("role") {
            if let Ok(user) = RawValue::from_string("\"user\"".to_string()) {
                turn.obj.set("role", user);
                turn.dirty = true;
            }
        }
    }
}

enum ToolsOutcome {
    Unchanged,
    Replace(Box<RawValue>),
    Remove,
}

/// Pass 4: normalize `tools`.
fn clean_tools(top: &RawObject<'_>, managed_identity: bool) -> Result<ToolsOutcome> {
    let Some(raw) = top.get("tools") else {
        return Ok(ToolsOutcome::Unchanged);
    };
    if !raw.get().trim_start().starts_with('[') {
        return Ok(ToolsOutcome::Unchanged);
    }
    let tools: Vec<Value> = serde_json::from_str(raw.get()).map_err(malformed)?;
    let total = tools.len();
    let mut dirty = false;
    let mut kept = Vec::with_capacity(total);

    for tool in tools {
        let Value::Object(mut tool) = tool else {
            continue;
        };

        if managed_identity {
            for hint in CLIENT_TOOL_HINTS {
                dirty |= tool.remove(hint).is_some();
            }
        }

        if let Some(Value::Array(declarations)) = tool.get_mut("functionDeclarations") {
            for declaration in declarations.iter_mut() {
                if let Value::Object(declaration) = declaration {
                    dirty |= declaration.remove("strict").is_some();
                    if let Some(Value::Object(parameters)) = declaration.get_mut("parameters") {
                        dirty |= strip_schema_keys(parameters);
                    }
                }
            }
            if declarations.is_empty() {
                continue;
            }
        }

        let actionable = tool.iter().any(|(key, value)| match key.as_str() {
            "functionDeclarations" => value.as_array().is_some_and(|a| !a.is_empty()),
            _ => !value.is_null(),
        });
        if actionable {
            kept.push(Value::Object(tool));
        }
    }

    if kept.is_empty() {
        return Ok(ToolsOutcome::Remove);
    }
    if !dirty && kept.len() == total {
        return Ok(ToolsOutcome::Unchanged);
    }
    let encoded = serde_json::value::to_raw_value(&kept).map_err(malformed)?;
    Ok(ToolsOutcome::Replace(encoded))
}

/// Remove `$schema` and `strict` from a schema and every nested schema.
/// Keys of a `properties` map are property names, so they are never removed.
fn strip_schema_keys(schema: &mut Map<String, Value>) -> bool {
    let mut changed = schema.remove("$schema").is_some();
    changed |= schema.remove("strict").is_some();
    for (key, value) in schema.iter_mut() {
        match (key.as_str(), value) {
            ("properties", Value::Object(props)) => {
                for prop in props.values_mut() {
                    changed |= strip_nested(prop);
                }
            }
            (_, value) => changed |= strip_nested(value),
        }
    }
    changed
}

fn strip_nested(value: &mut Value) -> bool {
    match value {
        Value::Object(map) => strip_schema_keys(map),
        Value::Array(items) => items.iter_mut().fold(false, |acc, v| strip_nested(v) | acc),
        _ => false,
    }
}
