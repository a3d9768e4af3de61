//! Schema description types.

use super::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Ascii,
    Utf8,
    Utf16Le,
}

impl TextEncoding {
    pub fn name(self) -> &'static str {
        match self {
            TextEncoding::Ascii => "ASCII",
            TextEncoding::Utf8 => "UTF-8",
            TextEncoding::Utf16Le => "UTF-16LE",
        }
    }
}

/// Source of a byte length or element count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Len {
    Fixed(u64),
    /// Value of an earlier integer field in the same record.
    Field(&'static str),
    /// `a * b * scale` over two earlier integer fields.
    Product(&'static str, &'static str, u64),
}

#[derive(Debug, Clone, Copy)]
pub enum FieldType {
    U8,
    I8,
    U16(Endian),
    I16(Endian),
    U32(Endian),
    I32(Endian),
    U64(Endian),
    I64(Endian),
    F32(Endian),
    F64(Endian),
    /// Unsigned integer whose byte width is only known at decode time.
    UInt { width: Len, endian: Endian },
    /// Padded text; content ends at the first NUL.
    Text { len: Len, encoding: TextEncoding },
    Bytes(Len),
    Array { count: Len, item: &'static FieldType },
    Record(&'static Schema),
    /// Captured as a [`super::Span`]; the bytes are skipped, not read.
    Lazy(Len),
}

impl FieldType {
    /// Encoded size when it does not depend on decoded data.
    pub fn fixed_size(&self) -> Option<u64> {
        match *self {
            FieldType::U8 | FieldType::I8 => Some(1),
            FieldType::U16(_) | FieldType::I16(_) => Some(2),
            FieldType::U32(_) | FieldType::I32(_) | FieldType::F32(_) => Some(4),
            FieldType::U64(_) | FieldType::I64(_) | FieldType::F64(_) => Some(8),
            FieldType::UInt { width: Len::Fixed(n), .. } => Some(n),
            FieldType::Text { len: Len::Fixed(n), .. } => Some(n),
            FieldType::Bytes(Len::Fixed(n)) | FieldType::Lazy(Len::Fixed(n)) => Some(n),
            FieldType::Array { count: Len::Fixed(n), item } => item.fixed_size().map(|s| s * n),
            FieldType::Record(schema) => schema.fixed_size(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub ty:   FieldType,
}

impl Field {
    pub const fn new(name: &'static str, ty: FieldType) -> Self {
        Self { name, ty }
    }
}

#[derive(Debug)]
pub struct Schema {
    pub name:   &'static str,
    pub fields: &'static [Field],
}

impl Schema {
    /// Total encoded size, or `None` if any field is data-dependent.
    pub fn fixed_size(&self) -> Option<u64> {
        self.fields.iter().map(|f| f.ty.fixed_size()).sum()
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Name → schema lookup for a vendor's record set.
#[derive(Debug, Clone, Copy)]
pub struct SchemaTable {
    schemas: &'static [&'static Schema],
}

impl SchemaTable {
    pub const fn new(schemas: &'static [&'static Schema]) -> Self {
        Self { schemas }
    }

    pub fn get(&self, name: &str) -> Option<&'static Schema> {
        self.schemas.iter().copied().find(|s| s.name == name)
    }

    pub fn require(&self, name: &str) -> Result<&'static Schema, DecodeError> {
        self.get(name).ok_or_else(|| DecodeError::UnknownSchema(name.to_owned()))
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.schemas.iter().map(|s| s.name)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

// ── Shorthands ───────────────────────────────────────────────────────────────

pub const U8: FieldType = FieldType::U8;
pub const U16LE: FieldType = FieldType::U16(Endian::Little);
pub const I16LE: FieldType = FieldType::I16(Endian::Little);
pub const U32LE: FieldType = FieldType::U32(Endian::Little);
pub const U32BE: FieldType = FieldType::U32(Endian::Big);
pub const I32LE: FieldType = FieldType::I32(Endian::Little);
pub const U64LE: FieldType = FieldType::U64(Endian::Little);
pub const I64LE: FieldType = FieldType::I64(Endian::Little);
pub const F32LE: FieldType = FieldType::F32(Endian::Little);
pub const F64LE: FieldType = FieldType::F64(Endian::Little);

pub const fn ascii(len: u64) -> FieldType {
    FieldType::Text { len: Len::Fixed(len), encoding: TextEncoding::Ascii }
}

pub const fn utf8(len: Len) -> FieldType {
    FieldType::Text { len, encoding: TextEncoding::Utf8 }
}

pub const fn utf16(len: Len) -> FieldType {
    FieldType::Text { len, encoding: TextEncoding::Utf16Le }
}

pub const fn bytes(len: Len) -> FieldType {
    FieldType::Bytes(len)
}

pub const fn lazy(len: Len) -> FieldType {
    FieldType::Lazy(len)
}

pub const fn uint_le(width: Len) -> FieldType {
    FieldType::UInt { width, endian: Endian::Little }
}

pub const fn array(count: Len, item: &'static FieldType) -> FieldType {
    FieldType::Array { count, item }
}

pub const fn record(schema: &'static Schema) -> FieldType {
    FieldType::Record(schema)
}
