//! Loosely-typed strategy documents.
//!
//! A [`Document`] is a JSON object tree (`serde_json::Value` is the closed set of
//! object/array/string/number/bool/null variants the merge rules are written against).
//! The importer only ever holds transient copies; the document store owns the canonical
//! version.

use crate::error::DocumentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Object fields of a document or of any nested object.
pub type Fields = Map<String, Value>;

/// Field used as the stored document id unless configured otherwise.
pub const DEFAULT_KEY_FIELD: &str = "id";

/// Timestamp fields, in order of preference.
const TIMESTAMP_FIELDS: [&str; 2] = ["dateModified", "dateCreated"];

/// Values accepted in the `type` field by strict validation.
const KNOWN_TYPES: [&str; 2] = ["REGULAR", "SUPER"];

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Fields);

impl Document {
    pub fn new(fields: Fields) -> Self {
        Self(fields)
    }

    /// Parse raw source bytes. The root must be a JSON object.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::try_from(value)
    }

    pub fn fields(&self) -> &Fields {
        &self.0
    }

    pub fn into_fields(self) -> Fields {
        self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable identifier stored under `key_field`. Numbers are accepted and rendered
    /// as their decimal text; empty strings are treated as missing.
    pub fn id(&self, key_field: &str) -> Option<String> {
        match self.0.get(key_field)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Like [`Document::id`] but reports a missing key as a [`DocumentError`].
    pub fn require_id(&self, key_field: &str) -> Result<String, DocumentError> {
        self.id(key_field)
            .ok_or_else(|| DocumentError::MissingKey(key_field.to_string()))
    }

    /// Document category (`REGULAR` / `SUPER`).
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    pub fn status(&self) -> Option<&str> {
        self.0.get("status").and_then(Value::as_str)
    }

    /// Most relevant data timestamp: `dateModified`, falling back to `dateCreated`.
    pub fn data_timestamp(&self) -> Option<DateTime<Utc>> {
        TIMESTAMP_FIELDS
            .iter()
            .filter_map(|field| self.0.get(*field).and_then(Value::as_str))
            .find_map(parse_timestamp)
    }

    /// Lightweight structural check used when strict validation is enabled.
    pub fn validate_strict(&self, key_field: &str) -> Result<(), DocumentError> {
        for field in [key_field, "type", "author"] {
            if !self.0.contains_key(field) {
                return Err(DocumentError::Validation(format!(
                    "missing required field '{}'",
                    field
                )));
            }
        }

        match self.kind() {
            Some(kind) if KNOWN_TYPES.contains(&kind) => Ok(()),
            other => Err(DocumentError::Validation(format!(
                "invalid type value {:?}",
                other
            ))),
        }
    }
}

impl TryFrom<Value> for Document {
    type Error = DocumentError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            _ => Err(DocumentError::NotAnObject),
        }
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        doc.into_value()
    }
}

/// Parse a document timestamp into UTC. Offsets are honoured; naive timestamps are
/// read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    dateparser::parse_with_timezone(raw, &Utc).ok()
}
