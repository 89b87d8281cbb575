//! Row identity derivation.
//!
//! A row's identity is the hex rendering of its primary-key tuple encoded
//! with CBOR-style headers:
//!
//! ```text
//! | array header (n keys) | key 1 header | key 1 payload | ... | key n header | key n payload |
//! ```
//!
//! Every item carries its own major type and length, so the encoding is
//! self-delimiting. Two different key tuples can never produce the same
//! identity, whatever characters the key values contain.

use crate::row::{KeySchema, TableRow};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write as _;

const MAJOR_UNSIGNED: u8 = 0;
const MAJOR_NEGATIVE: u8 = 1;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;

const SIMPLE_FALSE: u8 = 0xf4;
const SIMPLE_TRUE: u8 = 0xf5;
const SIMPLE_NULL: u8 = 0xf6;
const FLOAT64: u8 = 0xfb;

/// Stable identity of a mirrored row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(String);

impl RowId {
    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowId {
    fn from(s: &str) -> Self {
        RowId(s.to_string())
    }
}

/// Derives the identity of `row` from the key columns of `schema`.
///
/// Only key columns are read. A missing key column encodes as `Null`.
pub fn generate_id<R: TableRow>(row: &R, schema: &KeySchema) -> RowId {
    let columns = schema.columns();
    let mut encoder = KeyEncoder::with_capacity(columns.len() * 9 + 1);
    encoder.begin_tuple(columns.len());
    for column in columns {
        encoder.push(&row.column(column).unwrap_or(Value::Null));
    }
    RowId(encoder.finish_hex())
}

/// Encoder for primary-key tuples.
pub struct KeyEncoder {
    buffer: Vec<u8>,
}

impl KeyEncoder {
    /// Create a new encoder.
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Create a new encoder with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Writes the tuple header. Must precede the `len` pushed values.
    pub fn begin_tuple(&mut self, len: usize) {
        self.encode_unsigned(MAJOR_ARRAY, len as u64);
    }

    /// Appends one key value.
    pub fn push(&mut self, value: &Value) {
        match value {
            Value::Null => self.buffer.push(SIMPLE_NULL),
            Value::Bool(b) => self.buffer.push(if *b { SIMPLE_TRUE } else { SIMPLE_FALSE }),
            Value::Integer(n) => self.encode_integer(*n),
            Value::Float(x) => self.encode_float(*x),
            Value::Text(s) => {
                self.encode_unsigned(MAJOR_TEXT, s.len() as u64);
                self.buffer.extend_from_slice(s.as_bytes());
            }
        }
    }

    /// Get a reference to the encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consumes the encoder and returns the lowercase hex rendering.
    pub fn finish_hex(self) -> String {
        let mut out = String::with_capacity(self.buffer.len() * 2);
        for byte in &self.buffer {
            // Writing to a String cannot fail.
            let _ = write!(out, "{byte:02x}");
        }
        out
    }

    #[allow(clippy::cast_sign_loss)]
    fn encode_integer(&mut self, n: i64) {
        if n >= 0 {
            self.encode_unsigned(MAJOR_UNSIGNED, n as u64);
        } else {
            // -1 encodes as argument 0, -2 as 1, ...
            self.encode_unsigned(MAJOR_NEGATIVE, (-(n + 1)) as u64);
        }
    }

    fn encode_float(&mut self, x: f64) {
        let x = if x == 0.0 { 0.0 } else { x };
        self.buffer.push(FLOAT64);
        self.buffer.extend_from_slice(&x.to_bits().to_be_bytes());
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode_unsigned(&mut self, major_type: u8, value: u64) {
        let mt = major_type << 5;

        if value < 24 {
            self.buffer.push(mt | (value as u8));
        } else if u8::try_from(value).is_ok() {
            self.buffer.push(mt | 24);
            self.buffer.push(value as u8);
        } else if u16::try_from(value).is_ok() {
            self.buffer.push(mt | 25);
            self.buffer.extend_from_slice(&(value as u16).to_be_bytes());
        } else if u32::try_from(value).is_ok() {
            self.buffer.push(mt | 26);
            self.buffer.extend_from_slice(&(value as u32).to_be_bytes());
        } else {
            self.buffer.push(mt | 27);
            self.buffer.extend_from_slice(&value.to_be_bytes());
        }
    }
}

impl Default for KeyEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Row;
    use proptest::prelude::*;

    fn schema(columns: &[&str]) -> KeySchema {
        KeySchema::new(columns.iter().copied()).unwrap()
    }

    #[test]
    fn single_integer_key() {
        let row = Row::new().with("id", 1);
        // array(1), uint 1
        assert_eq!(generate_id(&row, &schema(&["id"])).as_str(), "8101");
    }

    #[test]
    fn text_key_is_length_prefixed() {
        let row = Row::new().with("id", "ab");
        // array(1), text(2) "ab"
        assert_eq!(generate_id(&row, &schema(&["id"])).as_str(), "81626162");
    }

    #[test]
    fn ignores_non_key_columns() {
        let s = schema(&["id"]);
        let a = Row::new().with("id", 9).with("title", "one");
        let b = Row::new().with("title", "two").with("done", true).with("id", 9);
        assert_eq!(generate_id(&a, &s), generate_id(&b, &s));
    }

    #[test]
    fn key_order_matters() {
        let row = Row::new().with("a", 1).with("b", 2);
        assert_ne!(
            generate_id(&row, &schema(&["a", "b"])),
            generate_id(&row, &schema(&["b", "a"]))
        );
    }

    #[test]
    fn delimiter_in_value_does_not_collide() {
        let s = schema(&["a", "b"]);
        let left = Row::new().with("a", "x:y").with("b", "z");
        let right = Row::new().with("a", "x").with("b", "y:z");
        assert_ne!(generate_id(&left, &s), generate_id(&right, &s));
    }

    #[test]
    fn value_kinds_do_not_collide() {
        let s = schema(&["id"]);
        let ids = [
            generate_id(&Row::new().with("id", 1), &s),
            generate_id(&Row::new().with("id", 1.0), &s),
            generate_id(&Row::new().with("id", "1"), &s),
            generate_id(&Row::new().with("id", true), &s),
            generate_id(&Row::new(), &s),
        ];
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn negative_zero_is_normalised() {
        let s = schema(&["x"]);
        assert_eq!(
            generate_id(&Row::new().with("x", -0.0), &s),
            generate_id(&Row::new().with("x", 0.0), &s)
        );
    }

    #[test]
    fn missing_key_reads_as_null() {
        let s = schema(&["id"]);
        assert_eq!(
            generate_id(&Row::new(), &s),
            generate_id(&Row::new().with("id", Value::Null), &s)
        );
    }

    fn key_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Integer),
            ".{0,12}".prop_map(Value::Text),
        ]
    }

    proptest! {
        #[test]
        fn identity_is_independent_of_other_columns(
            id in key_value(),
            extra in proptest::collection::btree_map("[a-z]{1,6}", key_value(), 0..6),
        ) {
            let s = schema(&["id"]);
            let bare = Row::new().with("id", id.clone());
            let mut padded = Row::from_pairs(extra.into_iter().filter(|(k, _)| k != "id"));
            padded.set("id", id);
            prop_assert_eq!(generate_id(&bare, &s), generate_id(&padded, &s));
        }

        #[test]
        fn distinct_text_pairs_never_collide(
            a1 in ".{0,8}", b1 in ".{0,8}", a2 in ".{0,8}", b2 in ".{0,8}",
        ) {
            prop_assume!((&a1, &b1) != (&a2, &b2));
            let s = schema(&["a", "b"]);
            let left = Row::new().with("a", a1).with("b", b1);
            let right = Row::new().with("a", a2).with("b", b2);
            prop_assert_ne!(generate_id(&left, &s), generate_id(&right, &s));
        }
    }
}
