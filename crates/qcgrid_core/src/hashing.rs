//! Canonical hashing for specifications and molecules.
//!
//! Algorithm:
//!   1. Build a canonical text form of the JSON value: object keys sorted,
//!      floats printed with 10 decimal digits, strings JSON-escaped.
//!   2. Hash: SHA-256 of the canonical form, hex-encoded.
//!
//! The canonical form is a hash input only - it is never parsed back, so
//! floats-as-fixed-decimals do not lose information anywhere that matters.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Decimal digits kept for floating-point values in hash inputs.
pub const FLOAT_DIGITS: usize = 10;

/// Compute the canonical hash of a JSON value.
pub fn hash_value(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Render a JSON value into its canonical text form.
pub fn canonical_form(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(u) = n.as_u64() {
                out.push_str(&u.to_string());
            } else {
                // Normalized fixed-point form so that 1.0 and 1.00000000001
                // either collide or differ deterministically.
                let f = n.as_f64().unwrap_or(0.0);
                out.push_str(&format_float(f));
            }
        }
        Value::String(s) => {
            // serde_json escaping is stable; reuse it.
            out.push_str(&serde_json::to_string(s).unwrap_or_default());
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
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

/// Fixed-point float formatting used throughout hash inputs.
pub fn format_float(f: f64) -> String {
    if f == 0.0 {
        // collapse -0.0
        return format!("{:.*}", FLOAT_DIGITS, 0.0);
    }
    format!("{:.*}", FLOAT_DIGITS, f)
}

/// Round a float to `digits` decimal places. Used when canonicalizing
/// molecule geometry, where the noise floor is coarser than `FLOAT_DIGITS`.
pub fn round_to(f: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (f * factor).round() / factor
}
