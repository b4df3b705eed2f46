//! Native SlideRule record stream.
//!
//! A streaming endpoint answers with `application/octet-stream`: a sequence of
//! records, each framed by an 8-byte big-endian header
//! (`version: i16`, `type_size: i16`, `data_size: i32`) followed by a
//! NUL-terminated record type name and the record payload. The payload layout
//! is described by a [`RecordDefinition`] that the server hands out on request.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::fatal;

pub(crate) const RECORD_HEADER_SIZE: usize = 8;
pub(crate) const RECORD_FORMAT_VERSION: i16 = 2;

/// Field types understood by the record codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Bitfield,
    Float,
    Double,
    Time8,
    String,
    /// Nested record of the named type.
    User(String),
}

impl FieldType {
    pub fn parse(name: &str) -> Self {
        match name {
            "INT8" => FieldType::Int8,
            "INT16" => FieldType::Int16,
            "INT32" => FieldType::Int32,
            "INT64" => FieldType::Int64,
            "UINT8" => FieldType::UInt8,
            "UINT16" => FieldType::UInt16,
            "UINT32" => FieldType::UInt32,
            "UINT64" => FieldType::UInt64,
            "BITFIELD" => FieldType::Bitfield,
            "FLOAT" => FieldType::Float,
            "DOUBLE" => FieldType::Double,
            "TIME8" => FieldType::Time8,
            "STRING" => FieldType::String,
            other => FieldType::User(other.to_string()),
        }
    }

    /// Coded data types used by endpoints that ship raw buffers (e.g. `h5file`).
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => FieldType::Int8,
            1 => FieldType::Int16,
            2 => FieldType::Int32,
            3 => FieldType::Int64,
            4 => FieldType::UInt8,
            5 => FieldType::UInt16,
            6 => FieldType::UInt32,
            7 => FieldType::UInt64,
            8 => FieldType::Bitfield,
            9 => FieldType::Float,
            10 => FieldType::Double,
            11 => FieldType::Time8,
            12 => FieldType::String,
            _ => return None,
        })
    }

    pub fn code(&self) -> Option<i64> {
        Some(match self {
            FieldType::Int8 => 0,
            FieldType::Int16 => 1,
            FieldType::Int32 => 2,
            FieldType::Int64 => 3,
            FieldType::UInt8 => 4,
            FieldType::UInt16 => 5,
            FieldType::UInt32 => 6,
            FieldType::UInt64 => 7,
            FieldType::Bitfield => 8,
            FieldType::Float => 9,
            FieldType::Double => 10,
            FieldType::Time8 => 11,
            FieldType::String => 12,
            FieldType::User(_) => return None,
        })
    }

    /// Size in bytes of one element; `None` for nested record types.
    pub fn size(&self) -> Option<usize> {
        match self {
            FieldType::Int8 | FieldType::UInt8 | FieldType::String => Some(1),
            FieldType::Int16 | FieldType::UInt16 => Some(2),
            FieldType::Int32 | FieldType::UInt32 | FieldType::Float => Some(4),
            FieldType::Int64 | FieldType::UInt64 | FieldType::Double | FieldType::Time8 => Some(8),
            FieldType::Bitfield => Some(0),
            FieldType::User(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub field_type: FieldType,
    /// Byte offset into the record payload.
    pub offset: usize,
    /// `1` for a scalar; `<= 0` means "fill the rest of the payload".
    pub elements: i64,
    pub flags: String,
}

impl FieldDef {
    pub fn is_pointer(&self) -> bool {
        self.flags.contains("PTR")
    }

    pub fn is_little_endian(&self) -> bool {
        self.flags.contains("LE")
    }
}

/// Layout of one record type, as returned by the `definition` endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDefinition {
    pub rectype: String,
    pub datasize: usize,
    pub fields: Vec<(String, FieldDef)>,
}

impl RecordDefinition {
    pub fn from_json(rectype: &str, doc: &Value) -> Result<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| fatal(format!("record definition for {} is not an object", rectype)))?;

        let datasize = obj
            .get("__datasize")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;

        let mut fields = Vec::new();
        for (name, field) in obj {
            if name.starts_with("__") {
                continue;
            }
            let field_type = field
                .get("type")
                .and_then(Value::as_str)
                .map(FieldType::parse)
                .ok_or_else(|| fatal(format!("field {}.{} has no type", rectype, name)))?;
            let offset_bits = field.get("offset").and_then(Value::as_u64).unwrap_or(0);
            let elements = field.get("elements").and_then(Value::as_i64).unwrap_or(1);
            let flags = match field.get("flags") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Array(a)) => a
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("|"),
                _ => String::new(),
            };
            fields.push((
                name.clone(),
                FieldDef {
                    field_type,
                    offset: (offset_bits / 8) as usize,
                    elements,
                    flags,
                },
            ));
        }

        Ok(Self {
            rectype: rectype.to_string(),
            datasize,
            fields,
        })
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }
}

/// Supplies record definitions to the decoder.
pub trait DefinitionSource {
    fn definition(&self, rectype: &str) -> Result<Arc<RecordDefinition>>;
}

/// A decoded value of a record field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    UInt(u64),
    Real(f64),
    Text(String),
    Array(Vec<FieldValue>),
    Record(Record),
    Records(Vec<Record>),
}

impl FieldValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::UInt(v) => Some(*v),
            FieldValue::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Real(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_records(&self) -> Option<&[Record]> {
        match self {
            FieldValue::Records(r) => Some(r),
            FieldValue::Record(r) => Some(std::slice::from_ref(r)),
            _ => None,
        }
    }

    /// Raw bytes of a `UINT8`/`INT8` array field.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            FieldValue::Array(items) => items
                .iter()
                .map(|v| match v {
                    FieldValue::UInt(b) => u8::try_from(*b).ok(),
                    FieldValue::Int(b) => i8::try_from(*b).ok().map(|b| b as u8),
                    _ => None,
                })
                .collect(),
            FieldValue::UInt(b) => u8::try_from(*b).ok().map(|b| vec![b]),
            _ => None,
        }
    }
}

/// A decoded record: its type name plus named fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    #[serde(rename = "__rectype")]
    pub rectype: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(rectype: impl Into<String>) -> Self {
        Self {
            rectype: rectype.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// One framed record as it came off the wire, not yet decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub rectype: String,
    pub data: Vec<u8>,
}

/// Incremental framer: feed it response chunks of any size.
#[derive(Debug, Default)]
pub struct RecordStreamParser {
    header: Vec<u8>,
    body: Vec<u8>,
    body_size: usize,
}

impl RecordStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<RawRecord>> {
        let mut out = Vec::new();
        let mut i = 0;

        while i < chunk.len() {
            if self.header.len() < RECORD_HEADER_SIZE {
                let take = (RECORD_HEADER_SIZE - self.header.len()).min(chunk.len() - i);
                self.header.extend_from_slice(&chunk[i..i + take]);
                i += take;

                if self.header.len() == RECORD_HEADER_SIZE {
                    let version = i16::from_be_bytes([self.header[0], self.header[1]]);
                    let type_size = i16::from_be_bytes([self.header[2], self.header[3]]);
                    let data_size = i32::from_be_bytes([
                        self.header[4],
                        self.header[5],
                        self.header[6],
                        self.header[7],
                    ]);
                    if version != RECORD_FORMAT_VERSION {
                        return Err(fatal(format!("Invalid record format: {}", version)));
                    }
                    if type_size < 0 || data_size < 0 {
                        return Err(fatal(format!(
                            "Invalid record size: type {} data {}",
                            type_size, data_size
                        )));
                    }
                    self.body_size = type_size as usize + data_size as usize;
                    if self.body_size == 0 {
                        self.header.clear();
                    }
                }
            } else {
                let take = (self.body_size - self.body.len()).min(chunk.len() - i);
                self.body.extend_from_slice(&chunk[i..i + take]);
                i += take;

                if self.body.len() == self.body_size {
                    out.push(split_record(std::mem::take(&mut self.body)));
                    self.header.clear();
                    self.body_size = 0;
                }
            }
        }

        Ok(out)
    }

    /// Bytes held for a record that has not been completed yet.
    pub fn pending_bytes(&self) -> usize {
        self.header.len() + self.body.len()
    }
}

fn split_record(mut body: Vec<u8>) -> RawRecord {
    match body.iter().position(|b| *b == 0) {
        Some(nul) => {
            let data = body.split_off(nul + 1);
            body.truncate(nul);
            RawRecord {
                rectype: String::from_utf8_lossy(&body).into_owned(),
                data,
            }
        }
        None => RawRecord {
            rectype: String::from_utf8_lossy(&body).into_owned(),
            data: Vec::new(),
        },
    }
}

/// Decodes a record payload using definitions from `defs`.
pub fn decode_record(rectype: &str, data: &[u8], defs: &dyn DefinitionSource) -> Result<Record> {
    let def = defs
        .definition(rectype)
        .with_context(|| format!("failed to get definition for record type {}", rectype))?;
    let mut rec = Record::new(rectype);

    for (name, field) in &def.fields {
        if field.is_pointer() {
            continue;
        }
        let little_endian = field.is_little_endian();

        match &field.field_type {
            FieldType::Bitfield => continue,
            FieldType::User(subtype) => {
                let subdef = defs.definition(subtype)?;
                if field.elements == 1 {
                    let slice = tail(data, field.offset, rectype, name)?;
                    rec.fields.insert(
                        name.clone(),
                        FieldValue::Record(decode_record(subtype, slice, defs)?),
                    );
                    continue;
                }

                if subdef.datasize == 0 {
                    return Err(fatal(format!(
                        "record type {} has zero size; cannot size {}.{}",
                        subtype, rectype, name
                    )));
                }
                let count = if field.elements <= 0 {
                    data.len().saturating_sub(field.offset) / subdef.datasize
                } else {
                    element_count(field.elements, rectype, name)?
                };

                // `count` is server-supplied; only the payload walk bounds it.
                let mut items = Vec::new();
                let mut offset = field.offset;
                for _ in 0..count {
                    let slice = tail(data, offset, rectype, name)?;
                    items.push(decode_record(subtype, slice, defs)?);
                    offset = offset.checked_add(subdef.datasize).ok_or_else(|| {
                        fatal(format!("record {} too short for field {}", rectype, name))
                    })?;
                }
                rec.fields.insert(name.clone(), FieldValue::Records(items));
            }
            FieldType::String => {
                let len = if field.elements <= 0 {
                    data.len().saturating_sub(field.offset)
                } else {
                    element_count(field.elements, rectype, name)?
                };
                let raw = span(data, field.offset, len, rectype, name)?;
                let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
                rec.fields.insert(
                    name.clone(),
                    FieldValue::Text(String::from_utf8_lossy(&raw[..end]).into_owned()),
                );
            }
            basic => {
                let size = basic.size().unwrap_or(1);
                let count = if field.elements <= 0 {
                    data.len().saturating_sub(field.offset) / size
                } else {
                    element_count(field.elements, rectype, name)?
                };
                let len = count.checked_mul(size).ok_or_else(|| {
                    fatal(format!("record {} too short for field {}", rectype, name))
                })?;
                let raw = span(data, field.offset, len, rectype, name)?;
                let values: Vec<FieldValue> = raw
                    .chunks_exact(size)
                    .map(|b| read_scalar(basic, b, little_endian))
                    .collect();

                let value = if field.elements == 1 {
                    values
                        .into_iter()
                        .next()
                        .ok_or_else(|| fatal(format!("empty scalar {}.{}", rectype, name)))?
                } else {
                    FieldValue::Array(values)
                };
                rec.fields.insert(name.clone(), value);
            }
        }
    }

    Ok(rec)
}

fn span<'a>(
    data: &'a [u8],
    offset: usize,
    len: usize,
    rectype: &str,
    field: &str,
) -> Result<&'a [u8]> {
    let end = offset.checked_add(len);
    end.and_then(|end| data.get(offset..end)).ok_or_else(|| {
        fatal(format!(
            "record {} too short for field {} ({} bytes at offset {}, payload is {})",
            rectype,
            field,
            len,
            offset,
            data.len()
        ))
    })
}

fn element_count(elements: i64, rectype: &str, field: &str) -> Result<usize> {
    usize::try_from(elements).map_err(|_| {
        fatal(format!(
            "record {} field {} has an unsupported element count {}",
            rectype, field, elements
        ))
    })
}

fn tail<'a>(data: &'a [u8], offset: usize, rectype: &str, field: &str) -> Result<&'a [u8]> {
    span(data, offset, data.len().saturating_sub(offset), rectype, field)
}

/// Reads one element of a basic type; `bytes.len()` must equal the type size.
pub(crate) fn read_scalar(ft: &FieldType, bytes: &[u8], little_endian: bool) -> FieldValue {
    macro_rules! num {
        ($t:ty) => {{
            let mut buf = [0u8; std::mem::size_of::<$t>()];
            buf.copy_from_slice(bytes);
            if little_endian {
                <$t>::from_le_bytes(buf)
            } else {
                <$t>::from_be_bytes(buf)
            }
        }};
    }

    match ft {
        FieldType::Int8 => FieldValue::Int(bytes[0] as i8 as i64),
        FieldType::Int16 => FieldValue::Int(num!(i16) as i64),
        FieldType::Int32 => FieldValue::Int(num!(i32) as i64),
        FieldType::Int64 | FieldType::Time8 => FieldValue::Int(num!(i64)),
        FieldType::UInt8 => FieldValue::UInt(bytes[0] as u64),
        FieldType::UInt16 => FieldValue::UInt(num!(u16) as u64),
        FieldType::UInt32 => FieldValue::UInt(num!(u32) as u64),
        FieldType::UInt64 => FieldValue::UInt(num!(u64)),
        FieldType::Float => FieldValue::Real(num!(f32) as f64),
        FieldType::Double => FieldValue::Real(num!(f64)),
        FieldType::String => FieldValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        FieldType::Bitfield | FieldType::User(_) => FieldValue::Array(Vec::new()),
    }
}
