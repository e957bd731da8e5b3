//! Derived-field extraction for structured payloads
//!
//! JSON object payloads are flattened into dotted key paths so the dashboard
//! can chart individual values. Geolocation and device identity are lifted
//! out when the payload carries them.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

const MAX_DEPTH: usize = 8;

const LATITUDE_KEYS: &[&str] = &["lat", "latitude"];
const LONGITUDE_KEYS: &[&str] = &["lng", "lon", "longitude"];
const DEVICE_KEYS: &[&str] = &["device_id", "deviceId", "device", "id"];
const NESTED_LOCATION_KEYS: &[&str] = &["location", "gps", "position"];

/// Fields stored alongside a message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedFields {
    pub extracted_keys: Option<BTreeMap<String, Value>>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub device_id: Option<String>,
}

/// Extract derived fields; non-object payloads yield nothing
pub fn extract_derived_fields(payload: &str) -> DerivedFields {
    let object = match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(object)) => object,
        _ => return DerivedFields::default(),
    };

    let mut keys = BTreeMap::new();
    flatten_into(&object, "", 0, &mut keys);

    DerivedFields {
        extracted_keys: if keys.is_empty() { None } else { Some(keys) },
        latitude: find_scalar(&object, LATITUDE_KEYS),
        longitude: find_scalar(&object, LONGITUDE_KEYS),
        device_id: find_scalar(&object, DEVICE_KEYS),
    }
}

/// Type tag used when describing an extracted key
pub fn key_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn flatten_into(object: &Map<String, Value>, prefix: &str, depth: usize, out: &mut BTreeMap<String, Value>) {
    for (key, value) in object {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };

        match value {
            Value::Object(nested) if depth + 1 < MAX_DEPTH && !nested.is_empty() => {
                flatten_into(nested, &path, depth + 1, out);
            }
            other => {
                out.insert(path, other.clone());
            }
        }
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn find_top_level(object: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| object.get(*name).and_then(scalar_to_string))
}

fn find_scalar(object: &Map<String, Value>, names: &[&str]) -> Option<String> {
    find_top_level(object, names).or_else(|| {
        NESTED_LOCATION_KEYS.iter().find_map(|outer| match object.get(*outer) {
            Some(Value::Object(inner)) => find_top_level(inner, names),
            _ => None,
        })
    })
}
