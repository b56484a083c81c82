//! Cache key construction and the reduced-data mode flag.
//!
//! A key must change whenever the response shape can change, and must not
//! change otherwise. [`CacheKey`] gets there by serialising every parameter
//! as canonical (sorted-key, recursively) JSON and appending the current
//! [`DataMode`] tag.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

/// Process-wide "reduced bandwidth" toggle.
///
/// Clones share the same flag, so one handle can be given to the UI layer
/// and another to the data layer. Every key built through [`CacheKey::build`]
/// reads the flag at that moment, so the two modes never share an entry.
#[derive(Debug, Clone, Default)]
pub struct DataMode {
    lite: Arc<AtomicBool>,
}

impl DataMode {
    /// Create a flag starting in the given mode.
    pub fn new(lite: bool) -> Self {
        Self {
            lite: Arc::new(AtomicBool::new(lite)),
        }
    }

    /// Switch reduced mode on or off. Takes effect for the next key built.
    pub fn set_lite(&self, lite: bool) {
        self.lite.store(lite, Ordering::SeqCst);
    }

    pub fn is_lite(&self) -> bool {
        self.lite.load(Ordering::SeqCst)
    }

    /// Key suffix for the current mode.
    pub fn tag(&self) -> &'static str {
        if self.is_lite() { "lite" } else { "full" }
    }
}

/// Builder for deterministic cache keys.
///
/// ```rust
/// # use mimir::{CacheKey, DataMode};
/// let mode = DataMode::new(false);
/// let a = CacheKey::new("search").param("q", "frieren").page(2).build(&mode);
/// let b = CacheKey::new("search").page(2).param("q", "frieren").build(&mode);
/// assert_eq!(a, b);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CacheKey {
    name: String,
    params: BTreeMap<String, Value>,
}

impl CacheKey {
    /// Start a key for the logical query `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    /// The logical query name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add (or replace) a parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Add every field of a JSON object as a parameter.
    ///
    /// Non-object values are stored under the `"value"` parameter.
    pub fn params(mut self, params: Value) -> Self {
        match params {
            Value::Object(map) => self.params.extend(map),
            Value::Null => {}
            other => {
                self.params.insert("value".to_string(), other);
            }
        }
        self
    }

    /// Pagination shorthand.
    pub fn page(self, page: u32) -> Self {
        self.param("page", page)
    }

    /// Render the key for the mode active right now.
    pub fn build(&self, mode: &DataMode) -> String {
        let mut params = String::from("{");
        for (i, (name, value)) in self.params.iter().enumerate() {
            if i > 0 {
                params.push(',');
            }
            params.push_str(&Value::String(name.clone()).to_string());
            params.push(':');
            write_canonical(value, &mut params);
        }
        params.push('}');
        format!("{}:{}:{}", self.name, params, mode.tag())
    }
}

/// Serialise `value` with object keys sorted at every depth.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<_, _> = map.iter().collect();
            out.push('{');
            for (i, (name, v)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
