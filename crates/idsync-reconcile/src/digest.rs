//! Content digests.
//!
//! A digest is the hex-encoded SHA-256 of an ordered tuple of JSON values.
//! Each value is written in canonical form (object keys sorted, no
//! whitespace) and prefixed with its byte length, so `("ab", "c")` and
//! `("a", "bc")` never collide.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Incremental digest over an ordered tuple of values.
#[derive(Debug, Clone, Default)]
pub struct DigestBuilder {
    hasher: Sha256,
}

impl DigestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next tuple element.
    pub fn field(&mut self, value: &Value) -> &mut Self {
        let mut bytes = Vec::new();
        write_canonical(value, &mut bytes);
        self.hasher.update((bytes.len() as u64).to_be_bytes());
        self.hasher.update(&bytes);
        self
    }

    /// 64 lowercase hex characters.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Digest of the given values, in order.
pub fn digest_values<'a>(values: impl IntoIterator<Item = &'a Value>) -> String {
    let mut builder = DigestBuilder::new();
    for value in values {
        builder.field(value);
    }
    builder.finish()
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(Value::from(key.as_str()).to_string().as_bytes());
                out.push(b':');
                write_canonical(item, out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}
