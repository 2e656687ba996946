//! Canonical hashing of a query and its result set.
//!
//! The digest input is the canonical filter followed by each matched
//! document, every piece terminated by `\n`:
//!
//! ```text
//! {"status":"paid"}\n{"id":1,"total":10}\n{"id":2,"total":20}\n
//! ```
//!
//! Canonical form is compact JSON with object keys sorted bytewise. Since
//! canonical JSON never contains a raw newline, the framing is unambiguous.
//! Documents are hashed in the order the store returned them.

use futures::{Stream, StreamExt};
use serde::{ser, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::{ContentHash, QueryIdentity};

/// A document value the canonical encoder cannot represent
#[derive(Debug, Error)]
#[error("document {index} cannot be canonically encoded: {message}")]
pub struct SerializationError {
    /// Position of the offending document in the sequence
    pub index: u64,
    pub message: String,
}

/// Incremental canonical hasher
pub struct CanonicalHasher {
    digest: Sha256,
    documents: u64,
    buffer: String,
}

impl CanonicalHasher {
    /// Start a digest seeded with the identity's filter
    pub fn new(identity: &QueryIdentity) -> Self {
        let mut hasher = Self {
            digest: Sha256::new(),
            documents: 0,
            buffer: String::new(),
        };
        hasher.feed(&identity.filter);
        hasher
    }

    /// Feed one matched document
    pub fn update(&mut self, document: &Value) {
        self.feed(document);
        self.documents += 1;
    }

    /// Feed one matched document of any serializable type.
    ///
    /// Fails on values JSON cannot represent, such as non-finite floats,
    /// which `serde_json` would otherwise encode as `null`.
    pub fn update_serialize<D: Serialize>(&mut self, document: &D) -> Result<(), SerializationError> {
        let value = document
            .serialize(FiniteCheck)
            .and_then(|()| serde_json::to_value(document))
            .map_err(|e| SerializationError {
                index: self.documents,
                message: e.to_string(),
            })?;
        self.update(&value);
        Ok(())
    }

    /// Number of documents fed so far
    pub fn document_count(&self) -> u64 {
        self.documents
    }

    /// Finish and return the hex digest
    pub fn finalize(self) -> ContentHash {
        ContentHash::from_digest(&self.digest.finalize())
    }

    fn feed(&mut self, value: &Value) {
        self.buffer.clear();
        write_canonical(value, &mut self.buffer);
        self.buffer.push('\n');
        self.digest.update(self.buffer.as_bytes());
    }
}

/// Hash a query's filter and an in-memory document sequence
pub fn compute<I, D>(identity: &QueryIdentity, documents: I) -> Result<ContentHash, SerializationError>
where
    I: IntoIterator<Item = D>,
    D: Serialize,
{
    let mut hasher = CanonicalHasher::new(identity);
    for document in documents {
        hasher.update_serialize(&document)?;
    }
    Ok(hasher.finalize())
}

/// Hash a query's filter and a lazily produced document sequence.
///
/// Consumes the stream one document at a time; the result set is never
/// buffered. Returns the digest and the number of documents hashed.
pub async fn compute_stream<S, E>(identity: &QueryIdentity, mut documents: S) -> Result<(ContentHash, u64), E>
where
    S: Stream<Item = Result<Value, E>> + Unpin,
{
    let mut hasher = CanonicalHasher::new(identity);
    while let Some(document) = documents.next().await {
        hasher.update(&document?);
    }
    let count = hasher.document_count();
    Ok((hasher.finalize(), count))
}

/// Canonical text form of a JSON value
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
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
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Serializer that produces nothing and only rejects non-finite floats
struct FiniteCheck;

fn check_float(value: f64) -> Result<(), serde_json::Error> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ser::Error::custom(format!("non-finite float {}", value)))
    }
}

impl ser::Serializer for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _: bool) -> Result<(), Self::Error> {
        Ok(())
    }
    fn serialize_i8(self, _: i8) -> Result<(), Self::Error> {
        Ok(())
    }
    fn serialize_i16(self, _: i16) -> Result<(), Self::Error> {
        Ok(())
    }
    fn serialize_i32(self, _: i32) -> Result<(), Self::Error> {
        Ok(())
    }
    fn serialize_i64(self, _: i64) -> Result<(), Self::Error> {
        Ok(())
    }
    fn serialize_i128(self, _: i128) -> Result<(), Self::Error> {
        Ok(())
    }
    fn serialize_u8(self, _: u8) -> Result<(), Self::Error> {
        Ok(())
    }
    fn serialize_u16(self, _: u16) -> Result<(), Self::Error> {
        Ok(())
    }
    fn serialize_u32(self, _: u32) -> Result<(), Self::Error> {
        Ok(())
    }
    fn serialize_u64(self, _: u64) -> Result<(), Self::Error> {
        Ok(())
    }
    fn serialize_u128(self, _: u128) -> Result<(), Self::Error> {
        Ok(())
    }
    fn serialize_f32(self, v: f32) -> Result<(), Self::Error> {
        check_float(f64::from(v))
    }
    fn serialize_f64(self, v: f64) -> Result<(), Self::Error> {
        check_float(v)
    }
    fn serialize_char(self, _: char) -> Result<(), Self::Error> {
        Ok(())
    }
    fn serialize_str(self, _: &str) -> Result<(), Self::Error> {
        Ok(())
    }
    fn serialize_bytes(self, _: &[u8]) -> Result<(), Self::Error> {
        Ok(())
    }
    fn serialize_none(self) -> Result<(), Self::Error> {
        Ok(())
    }
    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<(), Self::Error> {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Result<(), Self::Error> {
        Ok(())
    }
    fn serialize_unit_struct(self, _: &'static str) -> Result<(), Self::Error> {
        Ok(())
    }
    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Result<(), Self::Error> {
        Ok(())
    }
    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        value.serialize(self)
    }
    fn serialize_seq(self, _: Option<usize>) -> Result<Self, Self::Error> {
        Ok(self)
    }
    fn serialize_tuple(self, _: usize) -> Result<Self, Self::Error> {
        Ok(self)
    }
    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self, Self::Error> {
        Ok(self)
    }
    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, Self::Error> {
        Ok(self)
    }
    fn serialize_map(self, _: Option<usize>) -> Result<Self, Self::Error> {
        Ok(self)
    }
    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self, Self::Error> {
        Ok(self)
    }
    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, Self::Error> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Self::Error> {
        value.serialize(FiniteCheck)
    }
    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeTuple for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Self::Error> {
        value.serialize(FiniteCheck)
    }
    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Self::Error> {
        value.serialize(FiniteCheck)
    }
    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Self::Error> {
        value.serialize(FiniteCheck)
    }
    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeMap for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), Self::Error> {
        key.serialize(FiniteCheck)
    }
    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Self::Error> {
        value.serialize(FiniteCheck)
    }
    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeStruct for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        value.serialize(FiniteCheck)
    }
    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        value.serialize(FiniteCheck)
    }
    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}
