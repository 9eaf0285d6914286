//! Small shared helpers used across the model layer

use std::collections::BTreeMap;

/// An opaque, heterogeneous value used to represent extractor/metadata blobs.
///
/// Extractors (`gallery-dl`, `yt-dlp`) emit a tree of arbitrary JSON; rather than model every
/// site's metadata schema we keep it as this typed tree and expose narrow accessors for the
/// handful of keys the pipeline actually reads (`tags*`, `id`, `url`, `file_url`, `sample_url`,
/// `extension`, `filename`). Everything else round-trips unread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Borrow this value as a string, if it is one
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow this value as an object, if it is one
    #[must_use]
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Borrow this value as an array, if it is one
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Look up a key if this value is an object
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Flatten this value into a list of tag-like strings, per the `tags*` extraction rules:
    /// a plain string may be comma/whitespace separated, a list may contain strings or
    /// `{name: ...}` objects.
    #[must_use]
    pub fn flatten_tag_strings(&self) -> Vec<String> {
        match self {
            Value::String(s) => s
                .split([',', ' ', '\t', '\n'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Value::Array(items) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(obj) => obj.get("name").and_then(Value::as_str).map(str::to_string),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Pagination params shared by the job list/discover endpoints
#[derive(Debug, Clone, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::IntoParams))]
pub struct PageOpts {
    /// The max number of rows to return
    #[serde(default = "default_page_limit")]
    pub limit: u32,
    /// The number of rows to skip
    #[serde(default)]
    pub offset: u32,
}

fn default_page_limit() -> u32 {
    50
}

impl Default for PageOpts {
    fn default() -> Self {
        PageOpts {
            limit: default_page_limit(),
            offset: 0,
        }
    }
}
