use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// The parameter record of an operation, as assembled by the caller.
pub type Params = serde_json::Map<String, Value>;

/// Identifies one operation + parameter combination in the cache.
///
/// The key is the human-readable string `"{operation}:{params}"` with the
/// parameters in canonical form. Canonical means map keys are emitted in
/// sorted order at every nesting level, so two callers that assembled the
/// same parameter record in different orders share one cache slot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    raw: Arc<str>,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl CacheKey {
    /// Creates a [`CacheKey`] for an operation and its parameter record.
    pub fn from_parts(operation: &str, params: &Params) -> Self {
        let mut raw = String::with_capacity(operation.len() + 16);
        raw.push_str(operation);
        raw.push(':');
        write_canonical(&mut raw, &Value::Object(params.clone()));

        CacheKey { raw: raw.into() }
    }

    /// Creates a [`CacheKey`] from a caller-supplied string.
    ///
    /// Used when the caller wants to control cache identity directly instead
    /// of deriving it from operation and parameters. The caller is
    /// responsible for the stability of the string.
    pub fn custom(raw: impl Into<String>) -> Self {
        let raw: String = raw.into();
        CacheKey { raw: raw.into() }
    }

    /// The raw key string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Serializes a JSON value with object keys in sorted order at every level.
///
/// `serde_json` already keeps map keys sorted by default, but that is a
/// property of the build (the `preserve_order` feature flips it globally),
/// not a guarantee. Cache identity must not depend on feature unification,
/// so the ordering is made explicit here.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(&mut out, value);
    out
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(out, &map[key]);
            }
            out.push('}');
        }
        Value::Array(values) => {
            out.push('[');
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, value);
            }
            out.push(']');
        }
        primitive => out.push_str(&primitive.to_string()),
    }
}
