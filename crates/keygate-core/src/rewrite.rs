use bytes::Bytes;
use serde_json::{Map, Value};

use keygate_common::{Headers, header_remove, header_set};
use keygate_pool::HeaderRule;

/// Applies a group's param-override map to a JSON request body.
///
/// Plain values overwrite the field unconditionally. Two envelopes refine
/// that:
/// - `{"@map": {"old": "new"}}` remaps the field's current string value and
///   leaves it alone when there is no mapping entry;
/// - `{"@default": v}` sets the field only when the request left it out.
///
/// Non-object bodies pass through untouched.
pub fn apply_param_overrides(body: &[u8], overrides: &Map<String, Value>) -> Option<Bytes> {
    if overrides.is_empty() || body.is_empty() {
        return None;
    }
    let mut value: Value = serde_json::from_slice(body).ok()?;
    let object = value.as_object_mut()?;

    for (key, directive) in overrides {
        match directive.as_object() {
            Some(envelope) if envelope.contains_key("@map") => {
                let Some(mapping) = envelope.get("@map").and_then(Value::as_object) else {
                    continue;
                };
                let Some(current) = object.get(key).and_then(Value::as_str) else {
                    continue;
                };
                if let Some(mapped) = mapping.get(current) {
                    object.insert(key.clone(), mapped.clone());
                }
            }
            Some(envelope) if envelope.contains_key("@default") => {
                if !object.contains_key(key) {
                    object.insert(key.clone(), envelope["@default"].clone());
                }
            }
            _ => {
                object.insert(key.clone(), directive.clone());
            }
        }
    }

    serde_json::to_vec(&value).ok().map(Bytes::from)
}

pub fn apply_header_rules(headers: &mut Headers, rules: &[HeaderRule]) {
    for rule in rules {
        match &rule.value {
            Some(value) => header_set(headers, &rule.name, value.clone()),
            None => header_remove(headers, &rule.name),
        }
    }
}
