//! # Typed Value Codec
//!
//! Every value stored in the data table is a self-describing byte sequence:
//! a one-byte category tag followed by a category-specific body. Multi-byte
//! integers are little-endian. Paths are stored in the same encoding (a
//! `T`-tagged UTF-8 string), which is what makes the value index and the
//! detail joins line up byte-for-byte with the path column.
//!
//! ## Wire Format
//!
//! | Tag | Category | Body |
//! |-----|----------|------|
//! | `T` | text | raw UTF-8 bytes |
//! | `A` | byte array | raw bytes |
//! | `2` | single byte | 1 byte |
//! | `B` | boolean | 1 byte, 0 or 1 |
//! | `S` | 16-bit signed int | 2 bytes LE |
//! | `I` | 32-bit signed int | 4 bytes LE |
//! | `L` | 64-bit signed int | 8 bytes LE |
//! | `F` | 32-bit IEEE-754 | 4 bytes LE |
//! | `D` | 64-bit IEEE-754 | 8 bytes LE |
//! | `P` | structured binary | 2-byte LE type id + bincode body |
//! | `J` | structured text | 2-byte LE type id + JSON body |
//!
//! ## Structured Categories
//!
//! The two structured categories carry application-defined types. The codec
//! keeps a bidirectional registry per category (runtime type ⇄ 2-byte id),
//! populated up front via [`Codec::register_binary`] /
//! [`Codec::register_json`]. Encoding an unregistered type and decoding an
//! unregistered id are distinct errors per category. Registrations must
//! happen before the store is used concurrently.
//!
//! Typed access goes through [`Storable`]. The nine primitive types
//! implement it directly; a registered structured type opts in with an empty
//! impl whose default methods consult the registry:
//!
//! ```rust
//! use pathstore::{Codec, Storable};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
//! struct Contact {
//!     name: String,
//! }
//! impl Storable for Contact {}
//!
//! let codec = Codec::new();
//! codec.register_json::<Contact>(1);
//! let bytes = codec.encode(&Contact { name: "ox".into() }).unwrap();
//! assert_eq!(bytes[0], b'J');
//! ```

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

// =============================================================================
// Category Tags
// =============================================================================

pub const TEXT: u8 = b'T';
pub const BYTE_ARRAY: u8 = b'A';
pub const BYTE: u8 = b'2';
pub const BOOLEAN: u8 = b'B';
pub const SHORT: u8 = b'S';
pub const INT: u8 = b'I';
pub const LONG: u8 = b'L';
pub const FLOAT: u8 = b'F';
pub const DOUBLE: u8 = b'D';
pub const BINARY: u8 = b'P';
pub const JSON: u8 = b'J';

const ALL_TAGS: [u8; 11] = [
    TEXT, BYTE_ARRAY, BYTE, BOOLEAN, SHORT, INT, LONG, FLOAT, DOUBLE, BINARY, JSON,
];

// =============================================================================
// Free Helpers
// =============================================================================

/// Encodes a path or other plain string without consulting any registry.
pub(crate) fn encode_text(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + s.len());
    out.push(TEXT);
    out.extend_from_slice(s.as_bytes());
    out
}

/// Decodes a `T`-tagged payload back into a string.
pub(crate) fn decode_text(bytes: &[u8]) -> Result<String> {
    let (tag, body) = split_tag(bytes)?;
    if tag != TEXT {
        return Err(mismatch(tag, "String"));
    }
    String::from_utf8(body.to_vec()).map_err(|_| Error::Corrupt("text body is not valid UTF-8"))
}

/// True when the payload carries the binary-structured tag (`P`).
pub fn is_binary_message(bytes: &[u8]) -> bool {
    bytes.first() == Some(&BINARY)
}

/// Strips the category tag and 2-byte type id from a structured payload,
/// returning the raw body. `None` for non-structured or truncated payloads.
pub fn structured_body(bytes: &[u8]) -> Option<&[u8]> {
    match bytes.first() {
        Some(&BINARY) | Some(&JSON) if bytes.len() >= 3 => Some(&bytes[3..]),
        _ => None,
    }
}

fn split_tag(bytes: &[u8]) -> Result<(u8, &[u8])> {
    match bytes.split_first() {
        Some((tag, body)) => Ok((*tag, body)),
        None => Err(Error::Corrupt("empty payload")),
    }
}

/// Wrong-but-known tag becomes a type mismatch; anything else is an unknown
/// category.
fn mismatch(tag: u8, expected: &'static str) -> Error {
    if ALL_TAGS.contains(&tag) {
        Error::TypeMismatch { expected }
    } else {
        Error::UnknownCategory(tag)
    }
}

fn fixed_body<const N: usize>(body: &[u8]) -> Result<[u8; N]> {
    body.try_into()
        .map_err(|_| Error::Corrupt("body length does not match category"))
}

// =============================================================================
// Codec
// =============================================================================

type EncodeFn = Box<dyn Fn(&dyn Any) -> Result<Vec<u8>> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send + Sync>> + Send + Sync>;

struct StructuredCodec {
    encode: EncodeFn,
    decode: DecodeFn,
}

#[derive(Default)]
struct Registry {
    binary_ids: HashMap<TypeId, i16>,
    binary_codecs: HashMap<i16, StructuredCodec>,
    json_ids: HashMap<TypeId, i16>,
    json_codecs: HashMap<i16, StructuredCodec>,
}

/// Encodes and decodes every value crossing the SQL boundary.
///
/// Shared behind an `Arc` by the store, every transaction, every `Raw` and
/// the event loop. The registry lock is only written during registration.
pub struct Codec {
    registry: RwLock<Registry>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Registers `T` in the binary-structured (`P`) category under `id`.
    ///
    /// The body is bincode. Re-registering an id or type replaces the prior
    /// mapping.
    pub fn register_binary<T>(&self, id: i16)
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        let mut reg = self.registry.write();
        reg.binary_ids.insert(TypeId::of::<T>(), id);
        reg.binary_codecs.insert(
            id,
            StructuredCodec {
                encode: Box::new(|value| {
                    let value = value.downcast_ref::<T>().ok_or(Error::TypeMismatch {
                        expected: type_name::<T>(),
                    })?;
                    Ok(bincode::serialize(value)?)
                }),
                decode: Box::new(|body| Ok(Box::new(bincode::deserialize::<T>(body)?))),
            },
        );
    }

    /// Registers `T` in the text-structured (`J`) category under `id`.
    ///
    /// The body is JSON.
    pub fn register_json<T>(&self, id: i16)
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        let mut reg = self.registry.write();
        reg.json_ids.insert(TypeId::of::<T>(), id);
        reg.json_codecs.insert(
            id,
            StructuredCodec {
                encode: Box::new(|value| {
                    let value = value.downcast_ref::<T>().ok_or(Error::TypeMismatch {
                        expected: type_name::<T>(),
                    })?;
                    Ok(serde_json::to_vec(value)?)
                }),
                decode: Box::new(|body| Ok(Box::new(serde_json::from_slice::<T>(body)?))),
            },
        );
    }

    /// Encodes any [`Storable`] value into its tagged form.
    pub fn encode<T: Storable>(&self, value: &T) -> Result<Vec<u8>> {
        value.encode_value(self)
    }

    /// Decodes a tagged payload into the requested type.
    pub fn decode<T: Storable>(&self, bytes: &[u8]) -> Result<T> {
        T::decode_value(self, bytes)
    }

    /// Encodes a value of a registered structured type.
    ///
    /// Consulted by the default [`Storable`] methods. A type present in
    /// neither registry reports the text-category error (the fallback
    /// category for application types).
    fn encode_structured<T: Any>(&self, value: &T) -> Result<Vec<u8>> {
        let reg = self.registry.read();
        let type_id = TypeId::of::<T>();
        if let Some(&id) = reg.binary_ids.get(&type_id) {
            let body = (reg.binary_codecs[&id].encode)(value)?;
            return Ok(frame(BINARY, id, &body));
        }
        if let Some(&id) = reg.json_ids.get(&type_id) {
            let body = (reg.json_codecs[&id].encode)(value)?;
            return Ok(frame(JSON, id, &body));
        }
        Err(Error::UnregisteredTextType)
    }

    /// Decodes a structured payload into a registered type.
    fn decode_structured<T: Any>(&self, bytes: &[u8]) -> Result<T> {
        let (tag, body) = split_tag(bytes)?;
        if body.len() < 2 {
            return Err(Error::Corrupt("structured body shorter than its type id"));
        }
        let id = i16::from_le_bytes([body[0], body[1]]);
        let reg = self.registry.read();
        let (codec, unregistered) = match tag {
            BINARY => (reg.binary_codecs.get(&id), Error::UnregisteredBinaryType),
            JSON => (reg.json_codecs.get(&id), Error::UnregisteredTextType),
            other => return Err(mismatch(other, type_name::<T>())),
        };
        let codec = codec.ok_or(unregistered)?;
        let boxed = (codec.decode)(&body[2..])?;
        boxed
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| Error::TypeMismatch {
                expected: type_name::<T>(),
            })
    }
}

fn frame(tag: u8, id: i16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + body.len());
    out.push(tag);
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(body);
    out
}

// =============================================================================
// Storable
// =============================================================================

/// A value that can live in the store.
///
/// Implemented for the nine primitive categories below. Structured types get
/// the default methods, which route through the codec's registries; opting
/// in is a one-line empty impl plus a registration call.
pub trait Storable: Any + Send + Sync + Sized {
    fn encode_value(&self, codec: &Codec) -> Result<Vec<u8>> {
        codec.encode_structured(self)
    }

    fn decode_value(codec: &Codec, bytes: &[u8]) -> Result<Self> {
        codec.decode_structured(bytes)
    }
}

impl Storable for String {
    fn encode_value(&self, _codec: &Codec) -> Result<Vec<u8>> {
        Ok(encode_text(self))
    }

    fn decode_value(_codec: &Codec, bytes: &[u8]) -> Result<Self> {
        decode_text(bytes)
    }
}

impl Storable for Vec<u8> {
    fn encode_value(&self, _codec: &Codec) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(1 + self.len());
        out.push(BYTE_ARRAY);
        out.extend_from_slice(self);
        Ok(out)
    }

    fn decode_value(_codec: &Codec, bytes: &[u8]) -> Result<Self> {
        match split_tag(bytes)? {
            (BYTE_ARRAY, body) => Ok(body.to_vec()),
            (tag, _) => Err(mismatch(tag, "Vec<u8>")),
        }
    }
}

impl Storable for u8 {
    fn encode_value(&self, _codec: &Codec) -> Result<Vec<u8>> {
        Ok(vec![BYTE, *self])
    }

    fn decode_value(_codec: &Codec, bytes: &[u8]) -> Result<Self> {
        match split_tag(bytes)? {
            (BYTE, body) => Ok(fixed_body::<1>(body)?[0]),
            (tag, _) => Err(mismatch(tag, "u8")),
        }
    }
}

impl Storable for bool {
    fn encode_value(&self, _codec: &Codec) -> Result<Vec<u8>> {
        Ok(vec![BOOLEAN, u8::from(*self)])
    }

    fn decode_value(_codec: &Codec, bytes: &[u8]) -> Result<Self> {
        match split_tag(bytes)? {
            (BOOLEAN, body) => Ok(fixed_body::<1>(body)?[0] == 1),
            (tag, _) => Err(mismatch(tag, "bool")),
        }
    }
}

impl Storable for i16 {
    fn encode_value(&self, _codec: &Codec) -> Result<Vec<u8>> {
        let mut out = vec![SHORT];
        out.extend_from_slice(&self.to_le_bytes());
        Ok(out)
    }

    fn decode_value(_codec: &Codec, bytes: &[u8]) -> Result<Self> {
        match split_tag(bytes)? {
            (SHORT, body) => Ok(i16::from_le_bytes(fixed_body(body)?)),
            (tag, _) => Err(mismatch(tag, "i16")),
        }
    }
}

impl Storable for i32 {
    fn encode_value(&self, _codec: &Codec) -> Result<Vec<u8>> {
        let mut out = vec![INT];
        out.extend_from_slice(&self.to_le_bytes());
        Ok(out)
    }

    // Narrower stored integers widen safely.
    fn decode_value(_codec: &Codec, bytes: &[u8]) -> Result<Self> {
        match split_tag(bytes)? {
            (INT, body) => Ok(i32::from_le_bytes(fixed_body(body)?)),
            (SHORT, body) => Ok(i32::from(i16::from_le_bytes(fixed_body(body)?))),
            (tag, _) => Err(mismatch(tag, "i32")),
        }
    }
}

impl Storable for i64 {
    fn encode_value(&self, _codec: &Codec) -> Result<Vec<u8>> {
        let mut out = vec![LONG];
        out.extend_from_slice(&self.to_le_bytes());
        Ok(out)
    }

    // 64-bit is the canonical integer width on decode.
    fn decode_value(_codec: &Codec, bytes: &[u8]) -> Result<Self> {
        match split_tag(bytes)? {
            (LONG, body) => Ok(i64::from_le_bytes(fixed_body(body)?)),
            (INT, body) => Ok(i64::from(i32::from_le_bytes(fixed_body(body)?))),
            (SHORT, body) => Ok(i64::from(i16::from_le_bytes(fixed_body(body)?))),
            (tag, _) => Err(mismatch(tag, "i64")),
        }
    }
}

impl Storable for f32 {
    fn encode_value(&self, _codec: &Codec) -> Result<Vec<u8>> {
        let mut out = vec![FLOAT];
        out.extend_from_slice(&self.to_le_bytes());
        Ok(out)
    }

    fn decode_value(_codec: &Codec, bytes: &[u8]) -> Result<Self> {
        match split_tag(bytes)? {
            (FLOAT, body) => Ok(f32::from_le_bytes(fixed_body(body)?)),
            (tag, _) => Err(mismatch(tag, "f32")),
        }
    }
}

impl Storable for f64 {
    fn encode_value(&self, _codec: &Codec) -> Result<Vec<u8>> {
        let mut out = vec![DOUBLE];
        out.extend_from_slice(&self.to_le_bytes());
        Ok(out)
    }

    fn decode_value(_codec: &Codec, bytes: &[u8]) -> Result<Self> {
        match split_tag(bytes)? {
            (DOUBLE, body) => Ok(f64::from_le_bytes(fixed_body(body)?)),
            (FLOAT, body) => Ok(f64::from(f32::from_le_bytes(fixed_body(body)?))),
            (tag, _) => Err(mismatch(tag, "f64")),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
