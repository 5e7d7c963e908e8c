//! Order-preserving binary encoding of bson values.
//!
//! Comparing two encodings with plain byte comparison gives the same answer as comparing the
//! values: first by type class, then by value.  Resume tokens embed document keys in this form
//! so the opaque hex token sorts like the position it names.
//!
//! Layout of an encoded value is `<type tag> <body>`:
//!
//! | type | tag | body |
//! |------|-----|------|
//! | MinKey | 0x0A | - |
//! | Undefined | 0x0F | - |
//! | Null | 0x14 | - |
//! | Int32, Int64, Double | 0x1E | ordered f64 bits, rounding, subtype, exact integer bytes |
//! | String, Symbol | 0x3C | escaped bytes, 0x00, subtype |
//! | Document | 0x46 | (`tag` `escaped name` 0x00 `body`)* 0x04 |
//! | Array | 0x50 | (`tag` `body`)* 0x04 |
//! | Binary | 0x5A | len u32, subtype, bytes |
//! | ObjectId | 0x64 | 12 bytes |
//! | Boolean | 0x6E | 0 or 1 |
//! | DateTime | 0x78 | ordered i64 millis |
//! | Timestamp | 0x82 | time u32, increment u32 |
//! | others | 0xC8 | escaped raw bson of `{"": value}`, 0x00 |
//! | MaxKey | 0xF0 | - |
//!
//! Integers are big-endian.  A 0x00 byte inside a string is written as 0x00 0xFF.  An Int64
//! too large for an f64 records whether it lies below or above its rounded value, so it still
//! sorts by its true value against a double.
use std::cmp::Ordering;

use bson::oid::ObjectId;
use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document, Timestamp};

use crate::{FeedError, Result};

const MIN_KEY: u8 = 0x0A;
const UNDEFINED: u8 = 0x0F;
const NULL: u8 = 0x14;
const NUMERIC: u8 = 0x1E;
const STRING: u8 = 0x3C;
const OBJECT: u8 = 0x46;
const ARRAY: u8 = 0x50;
const BINARY: u8 = 0x5A;
const OBJECT_ID: u8 = 0x64;
const BOOLEAN: u8 = 0x6E;
const DATE: u8 = 0x78;
const TIMESTAMP: u8 = 0x82;
const OTHER: u8 = 0xC8;
const MAX_KEY: u8 = 0xF0;

/// closes a document or an array, sorts before every type tag.
const END: u8 = 0x04;

const NUM_INT32: u8 = 1;
const NUM_INT64: u8 = 2;
const NUM_DOUBLE: u8 = 3;

const ROUNDED_UP: u8 = 0;
const EXACT: u8 = 1;
const ROUNDED_DOWN: u8 = 2;

const STR_STRING: u8 = 0;
const STR_SYMBOL: u8 = 1;

const SIGN_BIT: u64 = 1 << 63;

/// Encode one value.
pub fn encode_value(value: &Bson) -> Vec<u8> {
    let mut out = Vec::new();
    append_value(&mut out, value);
    out
}

/// Encode a document, the result starts with the document tag.
pub fn encode_document(doc: &Document) -> Vec<u8> {
    let mut out = vec![OBJECT];
    append_fields(&mut out, doc);
    out
}

/// Append the encoding of `value` to `out`.
pub fn append_value(out: &mut Vec<u8>, value: &Bson) {
    out.push(type_tag(value));
    append_body(out, value);
}

/// Compare two documents the way their encodings compare.
pub fn compare_documents(a: &Document, b: &Document) -> Ordering {
    encode_document(a).cmp(&encode_document(b))
}

/// Decode a buffer holding exactly one value.
pub fn decode_value(bytes: &[u8]) -> Result<Bson> {
    let mut reader = Reader::new(bytes);
    let value = reader.read_value()?;
    if !reader.is_empty() {
        return Err(malformed("trailing bytes after value"));
    }
    Ok(value)
}

/// Decode a buffer holding exactly one document.
pub fn decode_document(bytes: &[u8]) -> Result<Document> {
    match decode_value(bytes)? {
        Bson::Document(doc) => Ok(doc),
        other => Err(malformed(&format!("expect a document, got {:?}", other))),
    }
}

fn type_tag(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => MIN_KEY,
        Bson::Undefined => UNDEFINED,
        Bson::Null => NULL,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => NUMERIC,
        Bson::String(_) | Bson::Symbol(_) => STRING,
        Bson::Document(_) => OBJECT,
        Bson::Array(_) => ARRAY,
        Bson::Binary(_) => BINARY,
        Bson::ObjectId(_) => OBJECT_ID,
        Bson::Boolean(_) => BOOLEAN,
        Bson::DateTime(_) => DATE,
        Bson::Timestamp(_) => TIMESTAMP,
        Bson::MaxKey => MAX_KEY,
        _ => OTHER,
    }
}

fn append_body(out: &mut Vec<u8>, value: &Bson) {
    match value {
        Bson::MinKey | Bson::MaxKey | Bson::Null | Bson::Undefined => {}
        Bson::Int32(v) => {
            out.extend_from_slice(&ordered_f64(*v as f64).to_be_bytes());
            out.push(EXACT);
            out.push(NUM_INT32);
            out.extend_from_slice(&((*v as u32) ^ (1 << 31)).to_be_bytes());
        }
        Bson::Int64(v) => {
            let approx = *v as f64;
            out.extend_from_slice(&ordered_f64(approx).to_be_bytes());
            out.push(match (*v as i128).cmp(&(approx as i128)) {
                Ordering::Less => ROUNDED_UP,
                Ordering::Equal => EXACT,
                Ordering::Greater => ROUNDED_DOWN,
            });
            out.push(NUM_INT64);
            out.extend_from_slice(&((*v as u64) ^ SIGN_BIT).to_be_bytes());
        }
        Bson::Double(v) => {
            out.extend_from_slice(&ordered_f64(*v).to_be_bytes());
            out.push(EXACT);
            out.push(NUM_DOUBLE);
        }
        Bson::String(s) => {
            append_escaped(out, s.as_bytes());
            out.push(STR_STRING);
        }
        Bson::Symbol(s) => {
            append_escaped(out, s.as_bytes());
            out.push(STR_SYMBOL);
        }
        Bson::Document(doc) => append_fields(out, doc),
        Bson::Array(items) => {
            for item in items {
                append_value(out, item);
            }
            out.push(END);
        }
        Bson::Binary(bin) => {
            out.extend_from_slice(&(bin.bytes.len() as u32).to_be_bytes());
            out.push(u8::from(bin.subtype));
            out.extend_from_slice(&bin.bytes);
        }
        Bson::ObjectId(oid) => out.extend_from_slice(&oid.bytes()),
        Bson::Boolean(b) => out.push(*b as u8),
        Bson::DateTime(dt) => {
            out.extend_from_slice(&((dt.timestamp_millis() as u64) ^ SIGN_BIT).to_be_bytes())
        }
        Bson::Timestamp(ts) => {
            out.extend_from_slice(&ts.time.to_be_bytes());
            out.extend_from_slice(&ts.increment.to_be_bytes());
        }
        other => {
            let mut raw = Vec::new();
            match doc! {"": other.clone()}.to_writer(&mut raw) {
                Ok(()) => append_escaped(out, &raw),
                // unserializable values still get a stable, if undecodable, key.
                Err(_) => append_escaped(out, format!("{:?}", other).as_bytes()),
            }
        }
    }
}

fn append_fields(out: &mut Vec<u8>, doc: &Document) {
    for (name, value) in doc {
        out.push(type_tag(value));
        append_escaped(out, name.as_bytes());
        append_body(out, value);
    }
    out.push(END);
}

fn append_escaped(out: &mut Vec<u8>, bytes: &[u8]) {
    for b in bytes {
        out.push(*b);
        if *b == 0 {
            out.push(0xFF);
        }
    }
    out.push(0);
}

fn ordered_f64(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits & SIGN_BIT != 0 {
        !bits
    } else {
        bits ^ SIGN_BIT
    }
}

fn unordered_f64(bits: u64) -> f64 {
    if bits & SIGN_BIT != 0 {
        f64::from_bits(bits ^ SIGN_BIT)
    } else {
        f64::from_bits(!bits)
    }
}

fn malformed(msg: &str) -> FeedError {
    FeedError::MalformedResumeToken(format!("bad key string: {}", msg))
}

/// Cursor over an encoded buffer, used by formats that embed key strings.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Start reading `buf` from the beginning.
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    /// All bytes consumed?
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Read one raw byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| malformed("unexpected end of input"))?;
        self.pos += 1;
        Ok(b)
    }

    /// Read `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| malformed("unexpected end of input"))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Read a big-endian u32.
    pub fn read_u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.read_bytes(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    /// Read a big-endian u64.
    pub fn read_u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.read_bytes(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    /// Read one tagged value.
    pub fn read_value(&mut self) -> Result<Bson> {
        let tag = self.read_u8()?;
        self.read_body(tag)
    }

    fn read_body(&mut self, tag: u8) -> Result<Bson> {
        let value = match tag {
            MIN_KEY => Bson::MinKey,
            MAX_KEY => Bson::MaxKey,
            UNDEFINED => Bson::Undefined,
            NULL => Bson::Null,
            NUMERIC => {
                let approx = unordered_f64(self.read_u64()?);
                match self.read_u8()? {
                    ROUNDED_UP | EXACT | ROUNDED_DOWN => {}
                    other => return Err(malformed(&format!("unknown rounding {}", other))),
                }
                match self.read_u8()? {
                    NUM_INT32 => Bson::Int32((self.read_u32()? ^ (1 << 31)) as i32),
                    NUM_INT64 => Bson::Int64((self.read_u64()? ^ SIGN_BIT) as i64),
                    NUM_DOUBLE => Bson::Double(approx),
                    other => return Err(malformed(&format!("unknown numeric subtype {}", other))),
                }
            }
            STRING => {
                let raw = self.read_escaped()?;
                let s = String::from_utf8(raw).map_err(|_| malformed("string is not valid utf-8"))?;
                match self.read_u8()? {
                    STR_STRING => Bson::String(s),
                    STR_SYMBOL => Bson::Symbol(s),
                    other => return Err(malformed(&format!("unknown string subtype {}", other))),
                }
            }
            OBJECT => Bson::Document(self.read_fields()?),
            ARRAY => {
                let mut items = vec![];
                loop {
                    match self.read_u8()? {
                        END => break,
                        tag => items.push(self.read_body(tag)?),
                    }
                }
                Bson::Array(items)
            }
            BINARY => {
                let len = self.read_u32()? as usize;
                let subtype = BinarySubtype::from(self.read_u8()?);
                let bytes = self.read_bytes(len)?.to_vec();
                Bson::Binary(Binary { subtype, bytes })
            }
            OBJECT_ID => {
                let mut raw = [0u8; 12];
                raw.copy_from_slice(self.read_bytes(12)?);
                Bson::ObjectId(ObjectId::from_bytes(raw))
            }
            BOOLEAN => Bson::Boolean(self.read_u8()? != 0),
            DATE => Bson::DateTime(bson::DateTime::from_millis(
                (self.read_u64()? ^ SIGN_BIT) as i64,
            )),
            TIMESTAMP => Bson::Timestamp(Timestamp {
                time: self.read_u32()?,
                increment: self.read_u32()?,
            }),
            OTHER => {
                let raw = self.read_escaped()?;
                let wrapper = Document::from_reader(&mut raw.as_slice())
                    .map_err(|e| malformed(&e.to_string()))?;
                wrapper
                    .get("")
                    .cloned()
                    .ok_or_else(|| malformed("empty wrapped value"))?
            }
            other => return Err(malformed(&format!("unknown type tag {:#04x}", other))),
        };
        Ok(value)
    }

    fn read_fields(&mut self) -> Result<Document> {
        let mut doc = Document::new();
        loop {
            match self.read_u8()? {
                END => break,
                tag => {
                    let name = String::from_utf8(self.read_escaped()?)
                        .map_err(|_| malformed("field name is not valid utf-8"))?;
                    let value = self.read_body(tag)?;
                    doc.insert(name, value);
                }
            }
        }
        Ok(doc)
    }

    fn read_escaped(&mut self) -> Result<Vec<u8>> {
        let mut raw = vec![];
        loop {
            match self.read_u8()? {
                0 => {
                    if self.buf.get(self.pos) == Some(&0xFF) {
                        self.pos += 1;
                        raw.push(0);
                    } else {
                        return Ok(raw);
                    }
                }
                b => raw.push(b),
            }
        }
    }
}
