//! Image descriptor shape and the serialized-array contract.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// One element of a `primary_image` JSON array.
///
/// Only the keys the URL pipeline reads are modelled. Unknown keys stay in the
/// stored text untouched; they are simply not surfaced here.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "originalUrl", default, skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    #[serde(rename = "fileUrl", default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
}

impl ImageDescriptor {
    /// `originalUrl` when present, else `fileUrl`.
    pub fn preferred_url(&self) -> Option<&str> {
        self.original_url.as_deref().or(self.file_url.as_deref())
    }

    fn from_object(map: &serde_json::Map<String, JsonValue>) -> Self {
        Self {
            id: map.get("id").and_then(scalar_to_string),
            original_url: map.get("originalUrl").and_then(non_empty_str),
            file_url: map.get("fileUrl").and_then(non_empty_str),
        }
    }
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a json array, found {0}")]
    NotAnArray(&'static str),
    #[error("element {0} is not an object")]
    NotAnObject(usize),
}

/// Strictly parse a cell as an ordered array of descriptors.
///
/// Fails on invalid JSON and on structural mismatches (top level not an array,
/// an element that is not an object). An empty array parses to an empty vec.
pub fn parse_descriptors(cell: &str) -> Result<Vec<ImageDescriptor>, DescriptorError> {
    let value: JsonValue = serde_json::from_str(cell)?;
    let JsonValue::Array(items) = value else {
        return Err(DescriptorError::NotAnArray(json_kind(&value)));
    };

    items
        .iter()
        .enumerate()
        .map(|(idx, item)| match item {
            JsonValue::Object(map) => Ok(ImageDescriptor::from_object(map)),
            _ => Err(DescriptorError::NotAnObject(idx)),
        })
        .collect()
}

fn non_empty_str(value: &JsonValue) -> Option<String> {
    value
        .as_str()
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
