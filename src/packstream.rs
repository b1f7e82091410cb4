//! PackStream binary serialization (the subset the transport exchanges).
//!
//! Covers null, booleans, integers, floats, strings, byte arrays, lists,
//! maps and structure headers — enough for HELLO/LOGON/LOGOFF/RESET/GOODBYE
//! requests and SUCCESS/FAILURE/IGNORED/RECORD summaries. Record *contents*
//! pass through the transport as opaque bytes and are not interpreted here.

use crate::errors::BoltError;
use std::collections::HashMap;

const MARKER_NULL: u8 = 0xC0;
const MARKER_FLOAT64: u8 = 0xC1;
const MARKER_FALSE: u8 = 0xC2;
const MARKER_TRUE: u8 = 0xC3;
const MARKER_INT8: u8 = 0xC8;
const MARKER_INT16: u8 = 0xC9;
const MARKER_INT32: u8 = 0xCA;
const MARKER_INT64: u8 = 0xCB;
const MARKER_BYTES8: u8 = 0xCC;
const MARKER_BYTES16: u8 = 0xCD;
const MARKER_BYTES32: u8 = 0xCE;
const MARKER_TINY_STRING: u8 = 0x80;
const MARKER_STRING8: u8 = 0xD0;
const MARKER_STRING16: u8 = 0xD1;
const MARKER_STRING32: u8 = 0xD2;
const MARKER_TINY_LIST: u8 = 0x90;
const MARKER_LIST8: u8 = 0xD4;
const MARKER_LIST16: u8 = 0xD5;
const MARKER_LIST32: u8 = 0xD6;
const MARKER_TINY_MAP: u8 = 0xA0;
const MARKER_MAP8: u8 = 0xD8;
const MARKER_MAP16: u8 = 0xD9;
const MARKER_MAP32: u8 = 0xDA;
const MARKER_TINY_STRUCT: u8 = 0xB0;
const MARKER_STRUCT8: u8 = 0xDC;
const MARKER_STRUCT16: u8 = 0xDD;

/// Nesting bound for reads; a hostile peer cannot drive the decoder into
/// unbounded recursion.
const MAX_NESTING_DEPTH: usize = 64;

/// A decoded PackStream value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Bytes(Vec<u8>),
    String(String),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Serializer appending PackStream bytes to an owned buffer.
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_null(&mut self) {
        self.buf.push(MARKER_NULL);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf
            .push(if value { MARKER_TRUE } else { MARKER_FALSE });
    }

    pub fn write_int(&mut self, value: i64) {
        match value {
            -16..=127 => self.buf.push(value as u8),
            -128..=127 => {
                self.buf.push(MARKER_INT8);
                self.buf.push(value as u8);
            }
            -32768..=32767 => {
                self.buf.push(MARKER_INT16);
                self.buf.extend_from_slice(&(value as i16).to_be_bytes());
            }
            -2147483648..=2147483647 => {
                self.buf.push(MARKER_INT32);
                self.buf.extend_from_slice(&(value as i32).to_be_bytes());
            }
            _ => {
                self.buf.push(MARKER_INT64);
                self.buf.extend_from_slice(&value.to_be_bytes());
            }
        }
    }

    pub fn write_float(&mut self, value: f64) {
        self.buf.push(MARKER_FLOAT64);
        self.buf.extend_from_slice(&value.to_bits().to_be_bytes());
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> Result<(), BoltError> {
        self.write_sized_marker(value.len(), None, MARKER_BYTES8, MARKER_BYTES16, MARKER_BYTES32)?;
        self.buf.extend_from_slice(value);
        Ok(())
    }

    pub fn write_string(&mut self, value: &str) -> Result<(), BoltError> {
        self.write_sized_marker(
            value.len(),
            Some(MARKER_TINY_STRING),
            MARKER_STRING8,
            MARKER_STRING16,
            MARKER_STRING32,
        )?;
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    pub fn write_list_header(&mut self, len: usize) -> Result<(), BoltError> {
        self.write_sized_marker(len, Some(MARKER_TINY_LIST), MARKER_LIST8, MARKER_LIST16, MARKER_LIST32)
    }

    pub fn write_map_header(&mut self, len: usize) -> Result<(), BoltError> {
        self.write_sized_marker(len, Some(MARKER_TINY_MAP), MARKER_MAP8, MARKER_MAP16, MARKER_MAP32)
    }

    /// Structure header: field count then the tag byte. All Bolt request
    /// messages are tiny structures (at most a handful of fields).
    pub fn write_struct_header(&mut self, tag: u8, fields: usize) -> Result<(), BoltError> {
        match fields {
            0..=15 => self.buf.push(MARKER_TINY_STRUCT | fields as u8),
            16..=255 => {
                self.buf.push(MARKER_STRUCT8);
                self.buf.push(fields as u8);
            }
            256..=65535 => {
                self.buf.push(MARKER_STRUCT16);
                self.buf.extend_from_slice(&(fields as u16).to_be_bytes());
            }
            _ => {
                return Err(BoltError::SerializationError(format!(
                    "structure cannot have {fields} fields"
                )));
            }
        }
        self.buf.push(tag);
        Ok(())
    }

    pub fn write_value(&mut self, value: &Value) -> Result<(), BoltError> {
        match value {
            Value::Null => self.write_null(),
            Value::Boolean(b) => self.write_bool(*b),
            Value::Integer(i) => self.write_int(*i),
            Value::Float(f) => self.write_float(*f),
            Value::Bytes(b) => self.write_bytes(b)?,
            Value::String(s) => self.write_string(s)?,
            Value::List(items) => {
                self.write_list_header(items.len())?;
                for item in items {
                    self.write_value(item)?;
                }
            }
            Value::Map(entries) => {
                self.write_map_header(entries.len())?;
                for (key, entry) in entries {
                    self.write_string(key)?;
                    self.write_value(entry)?;
                }
            }
        }
        Ok(())
    }

    pub fn write_map(&mut self, map: &HashMap<String, Value>) -> Result<(), BoltError> {
        self.write_map_header(map.len())?;
        for (key, value) in map {
            self.write_string(key)?;
            self.write_value(value)?;
        }
        Ok(())
    }

    fn write_sized_marker(
        &mut self,
        len: usize,
        tiny: Option<u8>,
        m8: u8,
        m16: u8,
        m32: u8,
    ) -> Result<(), BoltError> {
        match (len, tiny) {
            (0..=15, Some(tiny_marker)) => self.buf.push(tiny_marker | len as u8),
            (0..=255, _) => {
                self.buf.push(m8);
                self.buf.push(len as u8);
            }
            (256..=65535, _) => {
                self.buf.push(m16);
                self.buf.extend_from_slice(&(len as u16).to_be_bytes());
            }
            (65536..=4294967295, _) => {
                self.buf.push(m32);
                self.buf.extend_from_slice(&(len as u32).to_be_bytes());
            }
            _ => {
                return Err(BoltError::SerializationError(format!(
                    "collection of {len} elements exceeds the wire format"
                )));
            }
        }
        Ok(())
    }
}

impl Default for Writer {
    fn default() -> Self {
        Writer::new()
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Deserializer walking a borrowed byte slice.
pub struct Reader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Reader { input, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    /// Reads a structure header (field count + tag) without interpreting
    /// the fields.
    pub fn read_struct_header(&mut self) -> Result<(u8, usize), BoltError> {
        let marker = self.take_u8()?;
        let fields = match marker {
            m if m & 0xF0 == MARKER_TINY_STRUCT => (m & 0x0F) as usize,
            MARKER_STRUCT8 => self.take_u8()? as usize,
            MARKER_STRUCT16 => self.take_u16()? as usize,
            other => {
                return Err(BoltError::InvalidMessageFormat(format!(
                    "expected structure marker, found 0x{other:02X}"
                )));
            }
        };
        let tag = self.take_u8()?;
        Ok((tag, fields))
    }

    pub fn read_value(&mut self) -> Result<Value, BoltError> {
        self.read_value_at_depth(0)
    }

    /// Reads a map value; the transport's summaries are all single-map
    /// structures.
    pub fn read_map(&mut self) -> Result<HashMap<String, Value>, BoltError> {
        match self.read_value()? {
            Value::Map(map) => Ok(map),
            other => Err(BoltError::InvalidMessageFormat(format!(
                "expected map, found {other:?}"
            ))),
        }
    }

    fn read_value_at_depth(&mut self, depth: usize) -> Result<Value, BoltError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(BoltError::RecursionDepthExceeded);
        }
        let marker = self.take_u8()?;
        let value = match marker {
            MARKER_NULL => Value::Null,
            MARKER_TRUE => Value::Boolean(true),
            MARKER_FALSE => Value::Boolean(false),
            MARKER_FLOAT64 => Value::Float(f64::from_bits(u64::from_be_bytes(
                self.take_array::<8>()?,
            ))),
            MARKER_INT8 => Value::Integer(self.take_u8()? as i8 as i64),
            MARKER_INT16 => Value::Integer(i16::from_be_bytes(self.take_array::<2>()?) as i64),
            MARKER_INT32 => Value::Integer(i32::from_be_bytes(self.take_array::<4>()?) as i64),
            MARKER_INT64 => Value::Integer(i64::from_be_bytes(self.take_array::<8>()?)),
            MARKER_BYTES8 => {
                let len = self.take_u8()? as usize;
                Value::Bytes(self.take_slice(len)?.to_vec())
            }
            MARKER_BYTES16 => {
                let len = self.take_u16()? as usize;
                Value::Bytes(self.take_slice(len)?.to_vec())
            }
            MARKER_BYTES32 => {
                let len = self.take_u32()? as usize;
                Value::Bytes(self.take_slice(len)?.to_vec())
            }
            MARKER_STRING8 => {
                let len = self.take_u8()? as usize;
                self.take_string(len)?
            }
            MARKER_STRING16 => {
                let len = self.take_u16()? as usize;
                self.take_string(len)?
            }
            MARKER_STRING32 => {
                let len = self.take_u32()? as usize;
                self.take_string(len)?
            }
            MARKER_LIST8 => {
                let len = self.take_u8()? as usize;
                self.take_list(len, depth)?
            }
            MARKER_LIST16 => {
                let len = self.take_u16()? as usize;
                self.take_list(len, depth)?
            }
            MARKER_LIST32 => {
                let len = self.take_u32()? as usize;
                self.take_list(len, depth)?
            }
            MARKER_MAP8 => {
                let len = self.take_u8()? as usize;
                self.take_map(len, depth)?
            }
            MARKER_MAP16 => {
                let len = self.take_u16()? as usize;
                self.take_map(len, depth)?
            }
            MARKER_MAP32 => {
                let len = self.take_u32()? as usize;
                self.take_map(len, depth)?
            }
            m if m & 0xF0 == MARKER_TINY_STRING => self.take_string((m & 0x0F) as usize)?,
            m if m & 0xF0 == MARKER_TINY_LIST => self.take_list((m & 0x0F) as usize, depth)?,
            m if m & 0xF0 == MARKER_TINY_MAP => self.take_map((m & 0x0F) as usize, depth)?,
            // Tiny int: 0x00..=0x7F and 0xF0..=0xFF are the value itself.
            m if m < 0x80 || m >= 0xF0 => Value::Integer(m as i8 as i64),
            other => {
                return Err(BoltError::DeserializationError(format!(
                    "unsupported packstream marker 0x{other:02X}"
                )));
            }
        };
        Ok(value)
    }

    fn take_list(&mut self, len: usize, depth: usize) -> Result<Value, BoltError> {
        let mut items = Vec::new();
        items.try_reserve(len.min(1024)).map_err(|_| {
            BoltError::OutOfMemory(format!("allocating list of {len} elements"))
        })?;
        for _ in 0..len {
            items.push(self.read_value_at_depth(depth + 1)?);
        }
        Ok(Value::List(items))
    }

    fn take_map(&mut self, len: usize, depth: usize) -> Result<Value, BoltError> {
        let mut entries = HashMap::new();
        for _ in 0..len {
            let key = match self.read_value_at_depth(depth + 1)? {
                Value::String(s) => s,
                other => {
                    return Err(BoltError::DeserializationError(format!(
                        "map key must be a string, found {other:?}"
                    )));
                }
            };
            let value = self.read_value_at_depth(depth + 1)?;
            entries.insert(key, value);
        }
        Ok(Value::Map(entries))
    }

    fn take_string(&mut self, len: usize) -> Result<Value, BoltError> {
        let bytes = self.take_slice(len)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|e| BoltError::DeserializationError(format!("invalid utf-8 string: {e}")))?;
        Ok(Value::String(s.to_owned()))
    }

    fn take_u8(&mut self) -> Result<u8, BoltError> {
        let byte = *self.input.get(self.pos).ok_or_else(|| {
            BoltError::DeserializationError("unexpected end of packstream input".into())
        })?;
        self.pos += 1;
        Ok(byte)
    }

    fn take_u16(&mut self) -> Result<u16, BoltError> {
        Ok(u16::from_be_bytes(self.take_array::<2>()?))
    }

    fn take_u32(&mut self) -> Result<u32, BoltError> {
        Ok(u32::from_be_bytes(self.take_array::<4>()?))
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], BoltError> {
        let slice = self.take_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn take_slice(&mut self, len: usize) -> Result<&'a [u8], BoltError> {
        let end = self.pos.checked_add(len).ok_or_else(|| {
            BoltError::DeserializationError("length overflow in packstream input".into())
        })?;
        let slice = self.input.get(self.pos..end).ok_or_else(|| {
            BoltError::DeserializationError("unexpected end of packstream input".into())
        })?;
        self.pos = end;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: &Value) -> Value {
        let mut writer = Writer::new();
        writer.write_value(value).unwrap();
        let bytes = writer.into_bytes();
        let mut reader = Reader::new(&bytes);
        let decoded = reader.read_value().unwrap();
        assert_eq!(reader.remaining(), 0, "trailing bytes after {value:?}");
        decoded
    }

    #[test]
    fn scalars_round_trip() {
        for value in [
            Value::Null,
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Integer(0),
            Value::Integer(-1),
            Value::Integer(-16),
            Value::Integer(-17),
            Value::Integer(127),
            Value::Integer(128),
            Value::Integer(-32768),
            Value::Integer(2_147_483_648),
            Value::Integer(i64::MIN),
            Value::Float(1.5),
            Value::String("".into()),
            Value::String("bolt".into()),
            Value::String("x".repeat(300)),
            Value::Bytes(vec![0xDE, 0xAD]),
        ] {
            assert_eq!(round_trip(&value), value);
        }
    }

    #[test]
    fn tiny_int_encoding_is_single_byte() {
        let mut writer = Writer::new();
        writer.write_int(-16);
        writer.write_int(127);
        assert_eq!(writer.into_bytes(), vec![0xF0, 0x7F]);
    }

    #[test]
    fn nested_collections_round_trip() {
        let mut inner = HashMap::new();
        inner.insert("scheme".to_owned(), Value::from("basic"));
        inner.insert("attempts".to_owned(), Value::Integer(3));
        let value = Value::List(vec![
            Value::Map(inner),
            Value::List(vec![Value::from("utc")]),
            Value::Null,
        ]);
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn struct_header_round_trips() {
        let mut writer = Writer::new();
        writer.write_struct_header(0x70, 1).unwrap();
        writer.write_map(&HashMap::new()).unwrap();
        let bytes = writer.into_bytes();
        assert_eq!(bytes[0], 0xB1);
        assert_eq!(bytes[1], 0x70);
        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.read_struct_header().unwrap(), (0x70, 1));
        assert!(reader.read_map().unwrap().is_empty());
    }

    #[test]
    fn truncated_input_fails_cleanly() {
        let mut writer = Writer::new();
        writer.write_string("hello world").unwrap();
        let bytes = writer.into_bytes();
        let mut reader = Reader::new(&bytes[..bytes.len() - 3]);
        assert!(matches!(
            reader.read_value(),
            Err(BoltError::DeserializationError(_))
        ));
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let mut bytes = Vec::new();
        for _ in 0..200 {
            bytes.push(0x91); // tiny list of one element
        }
        bytes.push(0xC0);
        let mut reader = Reader::new(&bytes);
        assert!(matches!(
            reader.read_value(),
            Err(BoltError::RecursionDepthExceeded)
        ));
    }

    #[test]
    fn non_string_map_key_is_rejected() {
        // tiny map, 1 entry, integer key
        let bytes = [0xA1, 0x01, 0xC0];
        let mut reader = Reader::new(&bytes);
        assert!(matches!(
            reader.read_value(),
            Err(BoltError::DeserializationError(_))
        ));
    }
}
