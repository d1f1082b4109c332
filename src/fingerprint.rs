//! Stable identities for analyses
//!
//! A fingerprint names "this exact analysis of this experiment phase". It is
//! the cache key for snapshot reuse and feeds the scheduler's idempotency keys,
//! so it must not depend on field order, call site or process.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use std::fmt;

use crate::model::AnalysisSettings;

/// Hex-encoded SHA-256 over the canonical form of an analysis request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Compute the fingerprint of `settings` for one experiment phase.
pub fn fingerprint(
    experiment_id: &str,
    phase_index: usize,
    settings: &AnalysisSettings,
) -> Fingerprint {
    let payload = serde_json::json!({
        "experiment": experiment_id,
        "phase": phase_index,
        "settings": settings,
    });
    Fingerprint(digest(&payload))
}

/// SHA-256 of the canonical rendering of an arbitrary JSON value.
pub(crate) fn digest(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Render JSON with object keys sorted at every depth.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
