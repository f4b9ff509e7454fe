//! Binary codec for the document format: one type byte followed by a
//! fixed or length-prefixed payload per value. Documents and arrays carry a
//! leading u32 total length so a reader can skip them without parsing.

use uuid::Uuid;

use super::date_time::DateTime;
use super::decimal::Decimal;
use super::document::{Array, Document};
use super::object_id::ObjectId;
use super::value::{Value, ValueTag};
use crate::error::{DbError, Result};

// ============================================================================
// Writer
// ============================================================================

pub fn serialize_document(doc: &Document) -> Vec<u8> {
    let mut buf = Vec::with_capacity(document_len(doc));
    write_document(&mut buf, doc);
    buf
}

/// Serialized size of a whole document, including its length prefix.
pub fn document_len(doc: &Document) -> usize {
    4 + doc
        .iter()
        .map(|(k, v)| 1 + 2 + k.len() + payload_len(v))
        .sum::<usize>()
}

/// Serialized size of one value as an index key (tag + payload).
pub fn value_len(value: &Value) -> usize {
    1 + payload_len(value)
}

fn array_len(arr: &Array) -> usize {
    4 + arr.iter().map(value_len).sum::<usize>()
}

fn payload_len(value: &Value) -> usize {
    match value {
        Value::Null | Value::MinValue | Value::MaxValue => 0,
        Value::Boolean(_) => 1,
        Value::Int32(_) => 4,
        Value::Int64(_) | Value::Double(_) | Value::DateTime(_) => 8,
        Value::Decimal(_) => 17,
        Value::String(s) => 4 + s.len(),
        Value::Binary(b) => 4 + b.len(),
        Value::ObjectId(_) => 12,
        Value::Guid(_) => 16,
        Value::Document(d) => document_len(d),
        Value::Array(a) => array_len(a),
        Value::Vector(v) => 4 + v.len() * 4,
    }
}

fn write_document(buf: &mut Vec<u8>, doc: &Document) {
    buf.extend_from_slice(&(document_len(doc) as u32).to_le_bytes());
    for (key, value) in doc.iter() {
        buf.push(value.tag() as u8);
        buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        write_payload(buf, value);
    }
}

/// Write one value with its tag byte (index-key form).
pub fn write_value(buf: &mut Vec<u8>, value: &Value) {
    buf.push(value.tag() as u8);
    write_payload(buf, value);
}

fn write_payload(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null | Value::MinValue | Value::MaxValue => {}
        Value::Boolean(b) => buf.push(*b as u8),
        Value::Int32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Int64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Double(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Decimal(d) => {
            buf.push(d.scale() as u8);
            buf.extend_from_slice(&d.mantissa().to_le_bytes());
        }
        Value::String(s) => {
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Binary(b) => {
            buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
            buf.extend_from_slice(b);
        }
        Value::ObjectId(id) => buf.extend_from_slice(id.as_bytes()),
        Value::Guid(g) => buf.extend_from_slice(g.as_bytes()),
        Value::DateTime(dt) => buf.extend_from_slice(&dt.ticks().to_le_bytes()),
        Value::Document(d) => write_document(buf, d),
        Value::Array(a) => {
            buf.extend_from_slice(&(array_len(a) as u32).to_le_bytes());
            for item in a.iter() {
                write_value(buf, item);
            }
        }
        Value::Vector(v) => {
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            for f in v {
                buf.extend_from_slice(&f.to_le_bytes());
            }
        }
    }
}

// ============================================================================
// Reader
// ============================================================================

pub fn deserialize_document(bytes: &[u8]) -> Result<Document> {
    let mut reader = Reader::new(bytes);
    let doc = reader.read_document()?;
    Ok(doc)
}

/// Read one tagged value from the front of `bytes`; returns the value and
/// the number of bytes consumed.
pub fn deserialize_value(bytes: &[u8]) -> Result<(Value, usize)> {
    let mut reader = Reader::new(bytes);
    let value = reader.read_value()?;
    Ok((value, reader.pos))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| DbError::corruption("document payload truncated"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    fn read_document(&mut self) -> Result<Document> {
        let start = self.pos;
        let total = self.read_u32()? as usize;
        let end = start
            .checked_add(total)
            .filter(|&end| end <= self.bytes.len() && total >= 4)
            .ok_or_else(|| DbError::corruption("invalid document length"))?;

        let mut doc = Document::new();
        while self.pos < end {
            let tag = self.read_u8()?;
            let key_len = self.read_u16()? as usize;
            let key = std::str::from_utf8(self.take(key_len)?)
                .map_err(|_| DbError::corruption("non-utf8 field name"))?
                .to_string();
            let value = self.read_payload(tag)?;
            doc.insert(key, value);
        }
        if self.pos != end {
            return Err(DbError::corruption("document length mismatch"));
        }
        Ok(doc)
    }

    fn read_value(&mut self) -> Result<Value> {
        let tag = self.read_u8()?;
        self.read_payload(tag)
    }

    fn read_payload(&mut self, tag: u8) -> Result<Value> {
        let tag = ValueTag::from_u8(tag)
            .ok_or_else(|| DbError::corruption(format!("unknown value tag {tag:#04x}")))?;
        Ok(match tag {
            ValueTag::Null => Value::Null,
            ValueTag::MinValue => Value::MinValue,
            ValueTag::MaxValue => Value::MaxValue,
            ValueTag::Boolean => Value::Boolean(self.read_u8()? != 0),
            ValueTag::Int32 => {
                let b = self.take(4)?;
                Value::Int32(i32::from_le_bytes(b.try_into().expect("4 bytes")))
            }
            ValueTag::Int64 => Value::Int64(self.read_i64()?),
            ValueTag::Double => {
                let b = self.take(8)?;
                Value::Double(f64::from_le_bytes(b.try_into().expect("8 bytes")))
            }
            ValueTag::Decimal => {
                let scale = self.read_u8()? as u32;
                let b = self.take(16)?;
                Value::Decimal(Decimal::new(
                    i128::from_le_bytes(b.try_into().expect("16 bytes")),
                    scale,
                ))
            }
            ValueTag::String => {
                let len = self.read_u32()? as usize;
                let s = std::str::from_utf8(self.take(len)?)
                    .map_err(|_| DbError::corruption("non-utf8 string value"))?;
                Value::String(s.to_string())
            }
            ValueTag::Binary => {
                let len = self.read_u32()? as usize;
                Value::Binary(self.take(len)?.to_vec())
            }
            ValueTag::ObjectId => {
                let b = self.take(12)?;
                Value::ObjectId(ObjectId::from_bytes(b.try_into().expect("12 bytes")))
            }
            ValueTag::Guid => {
                let b = self.take(16)?;
                Value::Guid(Uuid::from_bytes(b.try_into().expect("16 bytes")))
            }
            ValueTag::DateTime => Value::DateTime(DateTime::from_ticks(self.read_i64()?)),
            ValueTag::Document => Value::Document(self.read_document()?),
            ValueTag::Array => {
                let start = self.pos;
                let total = self.read_u32()? as usize;
                let end = start
                    .checked_add(total)
                    .filter(|&end| end <= self.bytes.len() && total >= 4)
                    .ok_or_else(|| DbError::corruption("invalid array length"))?;
                let mut arr = Array::new();
                while self.pos < end {
                    arr.push(self.read_value()?);
                }
                if self.pos != end {
                    return Err(DbError::corruption("array length mismatch"));
                }
                Value::Array(arr)
            }
            ValueTag::Vector => {
                let count = self.read_u32()? as usize;
                let bytes = self.take(count.checked_mul(4).ok_or_else(|| {
                    DbError::corruption("vector length overflow")
                })?)?;
                let mut v = Vec::with_capacity(count);
                for chunk in bytes.chunks_exact(4) {
                    v.push(f32::from_le_bytes(chunk.try_into().expect("4 bytes")));
                }
                Value::Vector(v)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Document {
        Document::new()
            .with("_id", ObjectId::new())
            .with("name", "ada")
            .with("age", 36)
            .with("score", 99.5_f64)
            .with("flags", Value::Binary(vec![1, 2, 3]))
            .with(
                "tags",
                Array::from(vec![Value::from("a"), Value::from("b")]),
            )
            .with("nested", Document::new().with("x", 1i64))
            .with("embedding", vec![0.25_f32, -1.0, 3.5])
            .with("none", Value::Null)
    }

    #[test]
    fn document_round_trip() {
        let doc = sample();
        let bytes = serialize_document(&doc);
        assert_eq!(bytes.len(), document_len(&doc));
        let back = deserialize_document(&bytes).unwrap();
        assert_eq!(doc, back);
    }

    #[test]
    fn value_round_trip_preserves_tag() {
        for value in [
            Value::Null,
            Value::MinValue,
            Value::MaxValue,
            Value::Boolean(true),
            Value::Decimal("12.75".parse().unwrap()),
            Value::DateTime(DateTime::now()),
            Value::Guid(Uuid::new_v4()),
        ] {
            let mut buf = Vec::new();
            write_value(&mut buf, &value);
            assert_eq!(buf.len(), value_len(&value));
            let (back, used) = deserialize_value(&buf).unwrap();
            assert_eq!(used, buf.len());
            assert_eq!(back.tag() as u8, value.tag() as u8);
            assert_eq!(back, value);
        }
    }

    #[test]
    fn truncated_buffer_is_corruption() {
        let bytes = serialize_document(&sample());
        let err = deserialize_document(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, DbError::Corruption(_)));
    }

    #[test]
    fn unknown_tag_is_corruption() {
        let mut bytes = serialize_document(&Document::new().with("a", 1));
        bytes[4] = 0xEE;
        assert!(matches!(
            deserialize_document(&bytes).unwrap_err(),
            DbError::Corruption(_)
        ));
    }
}
