//! Resume tokens: opaque, totally ordered handles on a position of the event stream.
//!
//! A token is `{_data: "<uppercase hex>"}`.  The hex string decodes to:
//!
//! ```text
//! version        u8   (1)
//! cluster time   u32 seconds, u32 increment
//! token type     u8   (0 high water mark, 1 event)
//! txn op index   u32
//! from invalidate u8
//! uuid           u8 presence flag, then 16 bytes
//! document key   u8 presence flag, then key string of the document
//! ```
//!
//! Every integer is big-endian and the document key uses [key_string](crate::key_string), so two
//! tokens compare like the positions they encode, whether the raw bytes or the hex strings are
//! compared.
use std::cmp::Ordering;
use std::fmt;

use bson::{doc, Document, Timestamp};
use uuid::Uuid;

use crate::key_string::{self, Reader};
use crate::oplog::Position;
use crate::time_helper;
use crate::{FeedError, Result};

/// The only encoding version this crate produces and accepts.
pub const TOKEN_VERSION: u8 = 1;

const DATA_KEY: &str = "_data";

/// What kind of position a token names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TokenType {
    /// A point reached without an event, sorts before every event at the same timestamp.
    HighWaterMark = 0,
    /// The position of an emitted event.
    Event = 1,
}

/// Decoded content of a [ResumeToken].
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeTokenData {
    /// timestamp of the oplog entry.
    pub cluster_time: Timestamp,
    /// event or high water mark.
    pub token_type: TokenType,
    /// index of the operation inside its transaction.
    pub txn_op_index: u32,
    /// set on the token of an invalidate event.
    pub from_invalidate: bool,
    /// collection the event happened on.
    pub uuid: Option<Uuid>,
    /// key of the affected document, for CRUD events.
    pub document_key: Option<Document>,
}

impl ResumeTokenData {
    /// Token data for an event at `position`.
    pub fn event(position: Position, uuid: Option<Uuid>, document_key: Option<Document>) -> Self {
        ResumeTokenData {
            cluster_time: position.timestamp(),
            token_type: TokenType::Event,
            txn_op_index: position.apply_ops_index,
            from_invalidate: false,
            uuid,
            document_key,
        }
    }

    /// Token data naming the point just before anything at `ts`.
    pub fn high_water_mark(ts: Timestamp) -> Self {
        ResumeTokenData {
            cluster_time: ts,
            token_type: TokenType::HighWaterMark,
            txn_op_index: 0,
            from_invalidate: false,
            uuid: None,
            document_key: None,
        }
    }

    /// Oplog position the token points into.
    pub fn position(&self) -> Position {
        Position::new(self.cluster_time, self.txn_op_index)
    }

    /// Is this a high water mark rather than an event?
    pub fn is_high_water_mark(&self) -> bool {
        self.token_type == TokenType::HighWaterMark
    }

    /// Encode the data.
    pub fn encode(&self) -> ResumeToken {
        let mut out = Vec::with_capacity(32);
        out.push(TOKEN_VERSION);
        out.extend_from_slice(&self.cluster_time.time.to_be_bytes());
        out.extend_from_slice(&self.cluster_time.increment.to_be_bytes());
        out.push(self.token_type as u8);
        out.extend_from_slice(&self.txn_op_index.to_be_bytes());
        out.push(self.from_invalidate as u8);
        match &self.uuid {
            Some(uuid) => {
                out.push(1);
                out.extend_from_slice(uuid.as_bytes());
            }
            None => out.push(0),
        }
        match &self.document_key {
            Some(key) => {
                out.push(1);
                out.extend_from_slice(&key_string::encode_document(key));
            }
            None => out.push(0),
        }
        ResumeToken(to_hex(&out))
    }
}

/// Opaque resume token.  Ordering of tokens is the ordering of the positions they name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResumeToken(String);

impl ResumeToken {
    /// The hex payload.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the token, failing on malformed input or an unknown version.
    pub fn decode(&self) -> Result<ResumeTokenData> {
        let raw = from_hex(&self.0)?;
        let mut reader = Reader::new(&raw);
        let version = reader.read_u8()?;
        if version != TOKEN_VERSION {
            return Err(FeedError::InvalidResumeTokenVersion {
                found: version,
                expected: TOKEN_VERSION,
            });
        }
        let cluster_time = Timestamp {
            time: reader.read_u32()?,
            increment: reader.read_u32()?,
        };
        let token_type = match reader.read_u8()? {
            0 => TokenType::HighWaterMark,
            1 => TokenType::Event,
            other => {
                return Err(FeedError::MalformedResumeToken(format!(
                    "unknown token type {}",
                    other
                )))
            }
        };
        let txn_op_index = reader.read_u32()?;
        let from_invalidate = read_flag(&mut reader, "fromInvalidate")?;
        let uuid = if read_flag(&mut reader, "uuid")? {
            Some(
                Uuid::from_slice(reader.read_bytes(16)?)
                    .map_err(|e| FeedError::MalformedResumeToken(e.to_string()))?,
            )
        } else {
            None
        };
        let document_key = if read_flag(&mut reader, "documentKey")? {
            match reader.read_value()? {
                bson::Bson::Document(key) => Some(key),
                other => {
                    return Err(FeedError::MalformedResumeToken(format!(
                        "document key must be a document, got {:?}",
                        other
                    )))
                }
            }
        } else {
            None
        };
        if !reader.is_empty() {
            return Err(FeedError::MalformedResumeToken(
                "trailing bytes after document key".to_string(),
            ));
        }
        Ok(ResumeTokenData {
            cluster_time,
            token_type,
            txn_op_index,
            from_invalidate,
            uuid,
            document_key,
        })
    }

    /// `{_data: <hex>}`, the form handed to clients.
    pub fn to_document(&self) -> Document {
        doc! {DATA_KEY: self.0.clone()}
    }

    /// Parse and validate the client supplied form.
    pub fn from_document(doc: &Document) -> Result<Self> {
        let data = doc
            .get_str(DATA_KEY)
            .map_err(|_| FeedError::MalformedResumeToken(format!("missing {} in {}", DATA_KEY, doc)))?;
        let token = ResumeToken(data.to_ascii_uppercase());
        token.decode()?;
        Ok(token)
    }

    /// Three way comparison, as `-1`, `0` or `1`.
    pub fn compare(&self, other: &ResumeToken) -> i32 {
        match self.cmp(other) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }
}

impl From<ResumeTokenData> for ResumeToken {
    fn from(data: ResumeTokenData) -> Self {
        data.encode()
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compare two decoded tokens by cluster time only.
pub fn cmp_cluster_time(a: &ResumeTokenData, b: &ResumeTokenData) -> Ordering {
    time_helper::cmp(&a.cluster_time, &b.cluster_time)
}

fn read_flag(reader: &mut Reader, field: &str) -> Result<bool> {
    match reader.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(FeedError::MalformedResumeToken(format!(
            "invalid {} flag {}",
            field, other
        ))),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

fn from_hex(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(FeedError::MalformedResumeToken(format!(
            "odd length hex string {:?}",
            hex
        )));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| FeedError::MalformedResumeToken(format!("invalid hex {:?}", hex)))
        })
        .collect()
}
