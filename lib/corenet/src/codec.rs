//! Field-level binary encode/decode primitives (spec §4.2).
//!
//! Grounded in the teacher's manual (de)serialization style (`flux::contract::PrivateData`,
//! `t51core::net::frame::Header`): hand-rolled `byteorder` reads/writes rather than a
//! generic derive, because the wire format (length-tagged fields, enum-as-index,
//! default-on-absence for optional fields) doesn't map onto `serde`/`bincode` cleanly.
//!
//! `Writer`/`Reader` are the primitives a concrete `WireMessage`/`WireService`
//! implementation (owned by downstream crates — the concrete message schema is explicitly
//! out of scope here, spec §1) uses to build its `encode_body`/`decode_body`. The `_opt`
//! reader methods implement spec §4.2's "fields declared optional that are absent use
//! type-appropriate defaults"; the plain readers are strict and propagate truncation as an
//! error, for fields the schema marks required.
use crate::error::{CoreError, CoreResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

/// Accumulates an encoded message/service body.
#[derive(Default)]
pub struct Writer(Vec<u8>);

impl Writer {
    pub fn new() -> Writer {
        Writer(Vec::new())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn write_i32(&mut self, value: i32) {
        self.0.write_i32::<BigEndian>(value).expect("Vec<u8> write is infallible");
    }
    pub fn write_i64(&mut self, value: i64) {
        self.0.write_i64::<BigEndian>(value).expect("Vec<u8> write is infallible");
    }
    pub fn write_u32(&mut self, value: u32) {
        self.0.write_u32::<BigEndian>(value).expect("Vec<u8> write is infallible");
    }
    pub fn write_u64(&mut self, value: u64) {
        self.0.write_u64::<BigEndian>(value).expect("Vec<u8> write is infallible");
    }
    pub fn write_f32(&mut self, value: f32) {
        self.0.write_f32::<BigEndian>(value).expect("Vec<u8> write is infallible");
    }
    pub fn write_f64(&mut self, value: f64) {
        self.0.write_f64::<BigEndian>(value).expect("Vec<u8> write is infallible");
    }
    pub fn write_bool(&mut self, value: bool) {
        self.0.push(value as u8);
    }
    pub fn write_str(&mut self, value: &str) {
        let bytes = value.as_bytes();
        self.0
            .write_u16::<BigEndian>(bytes.len() as u16)
            .expect("Vec<u8> write is infallible");
        self.0.write_all(bytes).expect("Vec<u8> write is infallible");
    }
    /// Enum values are encoded as their integer index into the declared variant list.
    pub fn write_enum_index(&mut self, index: u32) {
        self.write_u32(index);
    }
    /// Arrays carry a length prefix; `item` encodes one element.
    pub fn write_array<T>(&mut self, items: &[T], mut item: impl FnMut(&mut Writer, &T)) {
        self.0
            .write_u32::<BigEndian>(items.len() as u32)
            .expect("Vec<u8> write is infallible");
        for value in items {
            item(self, value);
        }
    }
    /// Vectors are a fixed-arity component sequence with no length prefix (the arity is
    /// part of the schema, not the wire data).
    pub fn write_vector(&mut self, components: &[f32]) {
        for component in components {
            self.write_f32(*component);
        }
    }
    /// A nested message is encoded recursively; `Some` writes a presence byte of 1 followed
    /// by the nested body, `None` writes a presence byte of 0 (the "undefined" default of
    /// spec §4.2 for absent optional nested messages).
    pub fn write_nested(&mut self, nested: Option<&impl Fn(&mut Writer)>) {
        match nested {
            Some(encode) => {
                self.0.push(1);
                encode(self);
            }
            None => self.0.push(0),
        }
    }
}

/// Reads a message/service body out of a byte slice.
pub struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Reader<'a> {
        Reader { cursor: Cursor::new(bytes) }
    }

    fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().len().saturating_sub(pos)
    }

    fn truncated() -> CoreError {
        CoreError::MalformedFrame("truncated field")
    }

    pub fn read_i32(&mut self) -> CoreResult<i32> {
        self.cursor.read_i32::<BigEndian>().map_err(|_| Self::truncated())
    }
    pub fn read_i32_opt(&mut self, default: i32) -> i32 {
        self.read_i32().unwrap_or(default)
    }
    pub fn read_i64(&mut self) -> CoreResult<i64> {
        self.cursor.read_i64::<BigEndian>().map_err(|_| Self::truncated())
    }
    pub fn read_i64_opt(&mut self, default: i64) -> i64 {
        self.read_i64().unwrap_or(default)
    }
    pub fn read_u32(&mut self) -> CoreResult<u32> {
        self.cursor.read_u32::<BigEndian>().map_err(|_| Self::truncated())
    }
    pub fn read_u32_opt(&mut self, default: u32) -> u32 {
        self.read_u32().unwrap_or(default)
    }
    pub fn read_u64(&mut self) -> CoreResult<u64> {
        self.cursor.read_u64::<BigEndian>().map_err(|_| Self::truncated())
    }
    pub fn read_u64_opt(&mut self, default: u64) -> u64 {
        self.read_u64().unwrap_or(default)
    }
    pub fn read_f32(&mut self) -> CoreResult<f32> {
        self.cursor.read_f32::<BigEndian>().map_err(|_| Self::truncated())
    }
    pub fn read_f32_opt(&mut self, default: f32) -> f32 {
        self.read_f32().unwrap_or(default)
    }
    pub fn read_f64(&mut self) -> CoreResult<f64> {
        self.cursor.read_f64::<BigEndian>().map_err(|_| Self::truncated())
    }
    pub fn read_f64_opt(&mut self, default: f64) -> f64 {
        self.read_f64().unwrap_or(default)
    }
    pub fn read_bool(&mut self) -> CoreResult<bool> {
        let mut byte = [0u8; 1];
        self.cursor.read_exact(&mut byte).map_err(|_| Self::truncated())?;
        Ok(byte[0] != 0)
    }
    pub fn read_bool_opt(&mut self) -> bool {
        self.read_bool().unwrap_or(false)
    }
    pub fn read_str(&mut self) -> CoreResult<String> {
        let len = self.cursor.read_u16::<BigEndian>().map_err(|_| Self::truncated())? as usize;
        if self.remaining() < len {
            return Err(Self::truncated());
        }
        let mut bytes = vec![0u8; len];
        self.cursor.read_exact(&mut bytes).map_err(|_| Self::truncated())?;
        String::from_utf8(bytes).map_err(|_| CoreError::MalformedFrame("non-utf8 string field"))
    }
    pub fn read_str_opt(&mut self) -> String {
        self.read_str().unwrap_or_default()
    }
    pub fn read_enum_index(&mut self) -> CoreResult<u32> {
        self.read_u32()
    }
    /// Returns variant 0 (the "first enum", spec §4.2's default) if the field is absent.
    pub fn read_enum_index_opt(&mut self) -> u32 {
        self.read_enum_index().unwrap_or(0)
    }
    pub fn read_array<T>(&mut self, mut item: impl FnMut(&mut Reader) -> CoreResult<T>) -> CoreResult<Vec<T>> {
        let len = self.read_u32()? as usize;
        let mut items = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            items.push(item(self)?);
        }
        Ok(items)
    }
    pub fn read_array_opt<T>(&mut self, item: impl FnMut(&mut Reader) -> CoreResult<T>) -> Vec<T> {
        self.read_array(item).unwrap_or_default()
    }
    pub fn read_vector(&mut self, arity: usize) -> CoreResult<Vec<f32>> {
        let mut components = Vec::with_capacity(arity);
        for _ in 0..arity {
            components.push(self.read_f32()?);
        }
        Ok(components)
    }
    pub fn read_vector_opt(&mut self, arity: usize) -> Vec<f32> {
        self.read_vector(arity).unwrap_or_else(|_| vec![0.0; arity])
    }
    pub fn read_nested<T>(&mut self, decode: impl FnOnce(&mut Reader) -> CoreResult<T>) -> CoreResult<Option<T>> {
        let present = self.read_bool()?;
        if present {
            Ok(Some(decode(self)?))
        } else {
            Ok(None)
        }
    }

    pub fn finished(&self) -> bool {
        self.remaining() == 0
    }
}

/// An `io::Write` sink used when a `WireMessage`'s `encode_body` needs raw byte access
/// (e.g. composing with the `Writer` type above is not possible for a nested third-party
/// encoder). Kept narrow; most code should use `Writer` directly.
pub fn write_opcode<W: Write>(mut sink: W, opcode: u8) -> io::Result<()> {
    sink.write_u8(opcode)
}

pub fn read_opcode(bytes: &[u8]) -> CoreResult<(u8, &[u8])> {
    bytes
        .split_first()
        .map(|(op, rest)| (*op, rest))
        .ok_or_else(|| CoreError::MalformedFrame("empty frame"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_roundtrip() {
        let mut w = Writer::new();
        w.write_i32(-7);
        w.write_u64(900);
        w.write_bool(true);
        w.write_str("hello");
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_i32().unwrap(), -7);
        assert_eq!(r.read_u64().unwrap(), 900);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_str().unwrap(), "hello");
        assert!(r.finished());
    }

    #[test]
    fn truncated_optional_fields_default() {
        let bytes: Vec<u8> = Vec::new();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u32_opt(0), 0);
        assert_eq!(r.read_bool_opt(), false);
        assert_eq!(r.read_str_opt(), "");
        assert_eq!(r.read_enum_index_opt(), 0);
        assert_eq!(r.read_vector_opt(3), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn array_roundtrip() {
        let mut w = Writer::new();
        w.write_array(&[1u32, 2, 3], |w, v| w.write_u32(*v));
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        let items = r.read_array(|r| r.read_u32()).unwrap();
        assert_eq!(items, vec![1, 2, 3]);
    }
}
