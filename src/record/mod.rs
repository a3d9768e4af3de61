//! Declarative binary record decoding.
//!
//! A [`Schema`] is an ordered list of named [`Field`]s. Fields may be fixed
//! width integers and floats, padded text, nested records, arrays, or lazy
//! spans. Lengths and counts are either constants or refer back to an earlier
//! integer field of the same record ([`Len::Field`], [`Len::Product`]), which
//! covers the length-prefixed and shape-dependent layouts used by vendor
//! containers.
//!
//! Decoding produces a [`Record`]: the same field order with decoded
//! [`Value`]s. A [`Value::Span`] records `(absolute offset, length)` and the
//! reader seeks past the bytes without reading them; callers materialise the
//! span later through [`Span::read`].
//!
//! Record families with several known shapes are described by a
//! [`RecordFamily`], which picks a variant either by total byte size or by
//! trial decoding, treating a text or length failure as the signal to try the
//! next shape.
//!
//! # Endianness
//! Every integer and float field names its byte order explicitly.  There is
//! no default and no runtime detection.

mod schema;

use std::borrow::Cow;
use std::io::{self, Cursor, Read, Seek, SeekFrom};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use encoding_rs::UTF_16LE;
use log::trace;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use thiserror::Error;

pub use schema::{
    array, ascii, bytes, lazy, record, uint_le, utf16, utf8, Endian, Field, FieldType, Len,
    Schema, SchemaTable, TextEncoding, F32LE, F64LE, I16LE, I32LE, I64LE, U16LE, U32BE, U32LE,
    U64LE, U8,
};

/// Upper bound on any length or count read from the stream.
///
/// A length field read from the wrong format is usually garbage; refusing
/// anything above this keeps a misidentified file from allocating gigabytes.
pub const MAX_DYNAMIC_LEN: u64 = 256 * 1024 * 1024;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Field `{field}` of `{record}` is not valid {encoding} text")]
    Text { record: &'static str, field: &'static str, encoding: &'static str },
    #[error("Length of field `{field}` of `{record}`: {reason}")]
    Length { record: &'static str, field: &'static str, reason: String },
    #[error("Field `{field}` missing from `{record}` or of the wrong type")]
    MissingField { record: &'static str, field: &'static str },
    #[error("No schema named `{0}`")]
    UnknownSchema(String),
    #[error("No `{family}` variant matches {detail}")]
    NoVariant { family: &'static str, detail: String },
}

impl DecodeError {
    /// True when the failure says "these bytes are not this shape" rather
    /// than "the stream is broken".
    pub fn is_shape_mismatch(&self) -> bool {
        match self {
            DecodeError::Text { .. } | DecodeError::Length { .. } => true,
            DecodeError::Io(e) => e.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

// ── Values ───────────────────────────────────────────────────────────────────

/// Absolute byte range captured by a lazy field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Span {
    pub offset: u64,
    pub len:    u64,
}

impl Span {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    /// Seek to the span and read exactly its bytes.
    pub fn read<R: Read + Seek>(&self, reader: &mut R) -> io::Result<Vec<u8>> {
        reader.seek(SeekFrom::Start(self.offset))?;
        let mut buf = vec![0u8; self.len as usize];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    UInt(u64),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(serialize_with = "serialize_hex")] Vec<u8>),
    Array(Vec<Value>),
    Record(Record),
    Span(Span),
}

fn serialize_hex<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::UInt(v) => Some(v),
            Value::Int(v) if v >= 0 => Some(v as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v),
            Value::UInt(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(v) => Some(v),
            Value::UInt(v) => Some(v as f64),
            Value::Int(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_span(&self) -> Option<Span> {
        match self {
            Value::Span(s) => Some(*s),
            _ => None,
        }
    }
}

// ── Record ───────────────────────────────────────────────────────────────────

/// A decoded record.  Field order follows the schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub schema: &'static str,
    fields:     Vec<(&'static str, Value)>,
}

impl Record {
    fn new(schema: &'static str, capacity: usize) -> Self {
        Self { schema, fields: Vec::with_capacity(capacity) }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.fields.iter().map(|(n, v)| (*n, v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn missing(&self, field: &'static str) -> DecodeError {
        DecodeError::MissingField { record: self.schema, field }
    }

    pub fn uint(&self, field: &'static str) -> Result<u64, DecodeError> {
        self.get(field).and_then(Value::as_u64).ok_or_else(|| self.missing(field))
    }

    pub fn int(&self, field: &'static str) -> Result<i64, DecodeError> {
        self.get(field).and_then(Value::as_i64).ok_or_else(|| self.missing(field))
    }

    pub fn float(&self, field: &'static str) -> Result<f64, DecodeError> {
        self.get(field).and_then(Value::as_f64).ok_or_else(|| self.missing(field))
    }

    pub fn text(&self, field: &'static str) -> Result<&str, DecodeError> {
        self.get(field).and_then(Value::as_str).ok_or_else(|| self.missing(field))
    }

    pub fn record(&self, field: &'static str) -> Result<&Record, DecodeError> {
        self.get(field).and_then(Value::as_record).ok_or_else(|| self.missing(field))
    }

    pub fn span(&self, field: &'static str) -> Result<Span, DecodeError> {
        self.get(field).and_then(Value::as_span).ok_or_else(|| self.missing(field))
    }

    /// Integer array field as `u64`s.
    pub fn uints(&self, field: &'static str) -> Result<Vec<u64>, DecodeError> {
        let items = self.get(field).and_then(Value::as_array).ok_or_else(|| self.missing(field))?;
        items.iter().map(|v| v.as_u64().ok_or_else(|| self.missing(field))).collect()
    }

    /// Text array field.
    pub fn texts(&self, field: &'static str) -> Result<Vec<String>, DecodeError> {
        let items = self.get(field).and_then(Value::as_array).ok_or_else(|| self.missing(field))?;
        items
            .iter()
            .map(|v| v.as_str().map(str::to_owned).ok_or_else(|| self.missing(field)))
            .collect()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

// ── Decoding ─────────────────────────────────────────────────────────────────

impl Schema {
    /// Decode one record starting at the reader's current position.
    pub fn decode<R: Read + Seek>(&self, reader: &mut R) -> Result<Record, DecodeError> {
        let mut rec = Record::new(self.name, self.fields.len());
        for field in self.fields {
            let value = decode_value(reader, &field.ty, &rec, self.name, field.name)?;
            rec.fields.push((field.name, value));
        }
        Ok(rec)
    }

    /// Decode from an in-memory buffer.  Span offsets are relative to
    /// `base_offset`, so a buffer read from absolute offset `n` can pass `n`.
    pub fn decode_bytes(&self, bytes: &[u8], base_offset: u64) -> Result<Record, DecodeError> {
        let mut cursor = Cursor::new(bytes);
        let rec = self.decode(&mut cursor)?;
        Ok(rebase_spans(rec, base_offset))
    }
}

fn rebase_spans(mut rec: Record, base: u64) -> Record {
    if base == 0 {
        return rec;
    }
    for (_, v) in rec.fields.iter_mut() {
        rebase_value(v, base);
    }
    rec
}

fn rebase_value(v: &mut Value, base: u64) {
    match v {
        Value::Span(s) => s.offset += base,
        Value::Array(items) => items.iter_mut().for_each(|i| rebase_value(i, base)),
        Value::Record(r) => r.fields.iter_mut().for_each(|(_, i)| rebase_value(i, base)),
        _ => {}
    }
}

fn resolve_len(
    len:    &Len,
    ctx:    &Record,
    record: &'static str,
    field:  &'static str,
) -> Result<u64, DecodeError> {
    let lookup = |name: &'static str| -> Result<u64, DecodeError> {
        ctx.get(name).and_then(Value::as_u64).ok_or_else(|| DecodeError::Length {
            record,
            field,
            reason: format!("refers to `{name}`, which is not a decoded integer"),
        })
    };
    let n = match *len {
        Len::Fixed(n) => n,
        Len::Field(name) => lookup(name)?,
        Len::Product(a, b, scale) => lookup(a)?
            .checked_mul(lookup(b)?)
            .and_then(|n| n.checked_mul(scale))
            .ok_or_else(|| DecodeError::Length {
                record,
                field,
                reason: "product overflows".into(),
            })?,
    };
    if n > MAX_DYNAMIC_LEN {
        return Err(DecodeError::Length {
            record,
            field,
            reason: format!("{n} exceeds the {MAX_DYNAMIC_LEN} byte limit"),
        });
    }
    Ok(n)
}

fn decode_value<R: Read + Seek>(
    r:      &mut R,
    ty:     &FieldType,
    ctx:    &Record,
    record: &'static str,
    field:  &'static str,
) -> Result<Value, DecodeError> {
    use Endian::{Big, Little};

    let value = match *ty {
        FieldType::U8 => Value::UInt(r.read_u8()? as u64),
        FieldType::I8 => Value::Int(r.read_i8()? as i64),
        FieldType::U16(Little) => Value::UInt(r.read_u16::<LittleEndian>()? as u64),
        FieldType::U16(Big) => Value::UInt(r.read_u16::<BigEndian>()? as u64),
        FieldType::I16(Little) => Value::Int(r.read_i16::<LittleEndian>()? as i64),
        FieldType::I16(Big) => Value::Int(r.read_i16::<BigEndian>()? as i64),
        FieldType::U32(Little) => Value::UInt(r.read_u32::<LittleEndian>()? as u64),
        FieldType::U32(Big) => Value::UInt(r.read_u32::<BigEndian>()? as u64),
        FieldType::I32(Little) => Value::Int(r.read_i32::<LittleEndian>()? as i64),
        FieldType::I32(Big) => Value::Int(r.read_i32::<BigEndian>()? as i64),
        FieldType::U64(Little) => Value::UInt(r.read_u64::<LittleEndian>()?),
        FieldType::U64(Big) => Value::UInt(r.read_u64::<BigEndian>()?),
        FieldType::I64(Little) => Value::Int(r.read_i64::<LittleEndian>()?),
        FieldType::I64(Big) => Value::Int(r.read_i64::<BigEndian>()?),
        FieldType::F32(Little) => Value::Float(r.read_f32::<LittleEndian>()? as f64),
        FieldType::F32(Big) => Value::Float(r.read_f32::<BigEndian>()? as f64),
        FieldType::F64(Little) => Value::Float(r.read_f64::<LittleEndian>()?),
        FieldType::F64(Big) => Value::Float(r.read_f64::<BigEndian>()?),

        FieldType::UInt { ref width, endian } => {
            let n = resolve_len(width, ctx, record, field)?;
            if n > 8 {
                return Err(DecodeError::Length {
                    record,
                    field,
                    reason: format!("{n}-byte integer is wider than 64 bits"),
                });
            }
            let v = if n == 0 {
                0
            } else {
                match endian {
                    Little => r.read_uint::<LittleEndian>(n as usize)?,
                    Big => r.read_uint::<BigEndian>(n as usize)?,
                }
            };
            Value::UInt(v)
        }

        FieldType::Text { ref len, encoding } => {
            let n = resolve_len(len, ctx, record, field)? as usize;
            let mut buf = vec![0u8; n];
            r.read_exact(&mut buf)?;
            Value::Text(decode_text(&buf, encoding).ok_or(DecodeError::Text {
                record,
                field,
                encoding: encoding.name(),
            })?)
        }

        FieldType::Bytes(ref len) => {
            let n = resolve_len(len, ctx, record, field)? as usize;
            let mut buf = vec![0u8; n];
            r.read_exact(&mut buf)?;
            Value::Bytes(buf)
        }

        FieldType::Array { ref count, item } => {
            let n = resolve_len(count, ctx, record, field)? as usize;
            let mut items = Vec::with_capacity(n.min(4096));
            for _ in 0..n {
                items.push(decode_value(r, item, ctx, record, field)?);
            }
            Value::Array(items)
        }

        FieldType::Record(schema) => Value::Record(schema.decode(r)?),

        FieldType::Lazy(ref len) => {
            let n = resolve_len(len, ctx, record, field)?;
            let offset = r.stream_position()?;
            r.seek(SeekFrom::Current(n as i64))?;
            trace!("{record}.{field}: lazy span {offset}+{n}");
            Value::Span(Span { offset, len: n })
        }
    };
    Ok(value)
}

/// Decode fixed-width padded text.  Content ends at the first NUL.
fn decode_text(buf: &[u8], encoding: TextEncoding) -> Option<String> {
    match encoding {
        TextEncoding::Ascii => {
            let content = until_nul(buf);
            content.is_ascii().then(|| String::from_utf8_lossy(content).into_owned())
        }
        TextEncoding::Utf8 => std::str::from_utf8(until_nul(buf)).ok().map(str::to_owned),
        TextEncoding::Utf16Le => {
            let units = buf.len() / 2 * 2;
            let decoded: Cow<'_, str> =
                UTF_16LE.decode_without_bom_handling_and_without_replacement(&buf[..units])?;
            Some(match decoded.find('\0') {
                Some(end) => decoded[..end].to_owned(),
                None => decoded.into_owned(),
            })
        }
    }
}

fn until_nul(buf: &[u8]) -> &[u8] {
    match buf.iter().position(|&b| b == 0) {
        Some(end) => &buf[..end],
        None => buf,
    }
}

// ── Record families ──────────────────────────────────────────────────────────

/// How a family chooses between its shapes.
#[derive(Debug, Clone, Copy)]
pub enum Variants {
    /// Exact total byte size → schema.
    BySize(&'static [(u64, &'static Schema)]),
    /// Try each schema in order; a shape mismatch moves on to the next.
    Trial(&'static [&'static Schema]),
}

/// Several schemas describing one logical record type.
#[derive(Debug, Clone, Copy)]
pub struct RecordFamily {
    pub name:     &'static str,
    pub variants: Variants,
}

impl RecordFamily {
    /// Decode a record of `size` bytes at the reader's position.  The
    /// returned record's `schema` names the variant that matched.
    pub fn decode<R: Read + Seek>(&self, reader: &mut R, size: u64) -> Result<Record, DecodeError> {
        match self.variants {
            Variants::BySize(table) => {
                let schema = table
                    .iter()
                    .find(|(n, _)| *n == size)
                    .map(|(_, s)| *s)
                    .ok_or_else(|| DecodeError::NoVariant {
                        family: self.name,
                        detail: format!("a {size}-byte record"),
                    })?;
                schema.decode(reader)
            }
            Variants::Trial(schemas) => {
                let start = reader.stream_position()?;
                let mut last = None;
                for schema in schemas {
                    reader.seek(SeekFrom::Start(start))?;
                    match schema.decode(reader) {
                        Ok(rec) => return Ok(rec),
                        Err(e) if e.is_shape_mismatch() => {
                            trace!("{}: variant {} rejected: {e}", self.name, schema.name);
                            last = Some(e);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(DecodeError::NoVariant {
                    family: self.name,
                    detail: match last {
                        Some(e) => format!("the data ({e})"),
                        None => "the data".into(),
                    },
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    static PAIR: Schema = Schema {
        name: "pair",
        fields: &[
            Field::new("a", U16LE),
            Field::new("b", U32BE),
        ],
    };

    static STRINGS: Schema = Schema {
        name: "strings",
        fields: &[
            Field::new("n_strings", U32LE),
            Field::new("string_size", U32LE),
            Field::new("text", array(
                Len::Field("n_strings"),
                &FieldType::Text { len: Len::Field("string_size"), encoding: TextEncoding::Utf16Le },
            )),
        ],
    };

    static WITH_SPAN: Schema = Schema {
        name: "with_span",
        fields: &[
            Field::new("len", U32LE),
            Field::new("payload", lazy(Len::Field("len"))),
            Field::new("tail", U8),
        ],
    };

    static NESTED: Schema = Schema {
        name: "nested",
        fields: &[
            Field::new("tag", ascii(4)),
            Field::new("inner", record(&PAIR)),
            Field::new("shape", array(Len::Fixed(3), &U16LE)),
        ],
    };

    static LONG: Schema = Schema {
        name: "long",
        fields: &[Field::new("kind", U16LE), Field::new("label", ascii(8))],
    };
    static SHORT: Schema = Schema { name: "short", fields: &[Field::new("kind", U16LE)] };

    fn utf16_bytes(s: &str, width: usize) -> Vec<u8> {
        let mut out: Vec<u8> = s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        out.resize(width, 0);
        out
    }

    #[test]
    fn fixed_fields_honour_endianness() {
        let bytes = [0x34, 0x12, 0x00, 0x00, 0x01, 0x02];
        let rec = PAIR.decode_bytes(&bytes, 0).unwrap();
        assert_eq!(rec.uint("a").unwrap(), 0x1234);
        assert_eq!(rec.uint("b").unwrap(), 0x0102);
        assert_eq!(PAIR.fixed_size(), Some(6));
    }

    #[test]
    fn dependent_utf16_array() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(2).unwrap();
        bytes.write_u32::<LittleEndian>(16).unwrap();
        bytes.extend(utf16_bytes("HRA", 16));
        bytes.extend(utf16_bytes("Retina", 16));
        let rec = STRINGS.decode_bytes(&bytes, 0).unwrap();
        assert_eq!(rec.texts("text").unwrap(), vec!["HRA".to_string(), "Retina".to_string()]);
        assert_eq!(STRINGS.fixed_size(), None);
    }

    #[test]
    fn lazy_span_skips_payload() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(5).unwrap();
        bytes.extend_from_slice(b"hello");
        bytes.push(0x7f);
        let rec = WITH_SPAN.decode_bytes(&bytes, 100).unwrap();
        assert_eq!(rec.span("payload").unwrap(), Span { offset: 104, len: 5 });
        assert_eq!(rec.uint("tail").unwrap(), 0x7f);

        let mut cursor = Cursor::new(bytes);
        let rec = WITH_SPAN.decode(&mut cursor).unwrap();
        let span = rec.span("payload").unwrap();
        assert_eq!(span.read(&mut cursor).unwrap(), b"hello");
    }

    #[test]
    fn nested_record_and_array() {
        let mut bytes = b"CMDb".to_vec();
        bytes.extend_from_slice(&[0x01, 0x00, 0x00, 0x00, 0x00, 0x09]);
        for v in [3u16, 4, 5] {
            bytes.write_u16::<LittleEndian>(v).unwrap();
        }
        let rec = NESTED.decode_bytes(&bytes, 0).unwrap();
        assert_eq!(rec.text("tag").unwrap(), "CMDb");
        assert_eq!(rec.record("inner").unwrap().uint("b").unwrap(), 9);
        assert_eq!(rec.uints("shape").unwrap(), vec![3, 4, 5]);
        assert_eq!(NESTED.fixed_size(), Some(16));
    }

    #[test]
    fn padded_ascii_stops_at_nul_and_rejects_high_bytes() {
        let rec = LONG.decode_bytes(b"\x01\x00ab\0\0\0\0\0\0", 0).unwrap();
        assert_eq!(rec.text("label").unwrap(), "ab");

        let err = LONG.decode_bytes(b"\x01\x00\xffb\0\0\0\0\0\0", 0).unwrap_err();
        assert!(matches!(err, DecodeError::Text { field: "label", .. }));
        assert!(err.is_shape_mismatch());
    }

    #[test]
    fn implausible_dependent_length_is_rejected() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(u32::MAX).unwrap();
        let err = WITH_SPAN.decode_bytes(&bytes, 0).unwrap_err();
        assert!(matches!(err, DecodeError::Length { field: "payload", .. }));
    }

    #[test]
    fn family_selects_by_size() {
        static FAMILY: RecordFamily = RecordFamily {
            name: "obs",
            variants: Variants::BySize(&[(10, &LONG), (2, &SHORT)]),
        };
        let rec = FAMILY.decode(&mut Cursor::new(b"\x01\x00"), 2).unwrap();
        assert_eq!(rec.schema, "short");
        let rec = FAMILY.decode(&mut Cursor::new(b"\x00\x00camera\0\0"), 10).unwrap();
        assert_eq!(rec.schema, "long");
        assert!(matches!(
            FAMILY.decode(&mut Cursor::new(b"\x00\x00\x00"), 3),
            Err(DecodeError::NoVariant { .. })
        ));
    }

    #[test]
    fn family_trial_falls_back_on_text_failure() {
        static FAMILY: RecordFamily = RecordFamily {
            name: "obs",
            variants: Variants::Trial(&[&LONG, &SHORT]),
        };
        let bytes = b"\x01\x00\xfe\xfe\xfe\xfe\xfe\xfe\xfe\xfe";
        let rec = FAMILY.decode(&mut Cursor::new(&bytes[..]), bytes.len() as u64).unwrap();
        assert_eq!(rec.schema, "short");
        assert_eq!(rec.uint("kind").unwrap(), 1);
    }

    #[test]
    fn records_serialize_as_ordered_maps() {
        let rec = NESTED
            .decode_bytes(b"MDir\x02\x00\x00\x00\x00\x01\x01\x00\x02\x00\x03\x00", 0)
            .unwrap();
        let json = serde_json::to_string(&rec).unwrap();
        assert_eq!(json, r#"{"tag":"MDir","inner":{"a":2,"b":1},"shape":[1,2,3]}"#);
    }
}
