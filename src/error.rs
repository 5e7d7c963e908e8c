use bson::document::ValueAccessError;
use mongodb::error::{Error as MongoError, ErrorKind};
use std::result::Result as StdResult;
use thiserror::Error;
use uuid::Uuid;

use crate::blocking::CursorId;

/// Coarse error classes, used to decide who is allowed to retry what.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input from the caller, the feed is not opened or the pull is rejected.
    ClientRequest,
    /// Storage or network hiccup, safe to retry without changing input.
    Transient,
    /// The cursor is gone, the caller needs to open a new feed.
    Fatal,
    /// Replicas disagree about recorded history.
    DataIntegrity,
}

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Mongodb connection error")]
    MongoError(#[from] MongoError),
    #[error("Access bson value failed")]
    BsonError(#[from] ValueAccessError),
    #[error("Invalid value {val:?} for key {key:?}")]
    BsonValueError { key: String, val: String },
    #[error("Invalid namespace {0:?}, it should be split by `.`")]
    InvalidNamespace(String),
    #[error("Malformed resume token: {0}")]
    MalformedResumeToken(String),
    #[error("Resume token version {found} is not supported, expected {expected}")]
    InvalidResumeTokenVersion { found: u8, expected: u8 },
    #[error("Can't resume from token {token}: {reason}")]
    ResumeTokenNotFound { token: String, reason: String },
    #[error("Invalid change feed request: {0}")]
    InvalidRequest(String),
    #[error("Transient storage error: {0}")]
    TransientStorage(String),
    #[error("Oplog read still failing after {attempts} attempts")]
    StorageRetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<FeedError>,
    },
    #[error("Cursor {0} not found")]
    CursorNotFound(CursorId),
    #[error("Cursor {0} is serving another request")]
    CursorInUse(CursorId),
    #[error("Cursor {0} has been invalidated")]
    CursorInvalidated(CursorId),
    #[error("Cursor {0} has been killed")]
    CursorKilled(CursorId),
    #[error("Primary stepped down while waiting for a majority snapshot in term {term}")]
    PrimarySteppedDown { term: i64 },
    #[error("Pre-images of collection {ns_uuid} disagree: {origin_node} has {origin_entry}, {node} has {entry}")]
    PreImageInconsistency {
        ns_uuid: Uuid,
        origin_node: String,
        origin_entry: String,
        node: String,
        entry: String,
    },
    #[error("Pre-image for collection {ns_uuid} at {position} already recorded with another document")]
    DuplicatePreImage { ns_uuid: Uuid, position: String },
    #[error("Oplog entry at {appended} is not after the latest entry {latest}")]
    OutOfOrderAppend { appended: String, latest: String },
    #[error("Namespace {0} does not exist")]
    NamespaceNotFound(String),
    #[error("Document {key} not found in {ns}")]
    DocumentNotFound { ns: String, key: String },
    #[error("Parse configuration failed")]
    ConfigError(#[from] toml::de::Error),
    #[error("Io error")]
    IoError(#[from] std::io::Error),
}

impl FeedError {
    /// Which part of the error taxonomy this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        use FeedError::*;
        match self {
            MongoError(e) if is_transient_mongo_error(e) => ErrorCategory::Transient,
            TransientStorage(_) | StorageRetriesExhausted { .. } | CursorInUse(_) => {
                ErrorCategory::Transient
            }
            MalformedResumeToken(_)
            | InvalidResumeTokenVersion { .. }
            | ResumeTokenNotFound { .. }
            | InvalidRequest(_)
            | InvalidNamespace(_)
            | NamespaceNotFound(_)
            | DocumentNotFound { .. }
            | ConfigError(_) => ErrorCategory::ClientRequest,
            PreImageInconsistency { .. } => ErrorCategory::DataIntegrity,
            _ => ErrorCategory::Fatal,
        }
    }

    /// Storage level errors the cursor may retry itself at the same position.
    pub fn is_transient(&self) -> bool {
        match self {
            FeedError::TransientStorage(_) => true,
            FeedError::MongoError(e) => is_transient_mongo_error(e),
            _ => false,
        }
    }

    /// Tell if the caller may re-issue the same request with the same cursor.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

fn is_transient_mongo_error(error: &MongoError) -> bool {
    matches!(
        error.kind.as_ref(),
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. }
    )
}

pub type Result<T> = StdResult<T, FeedError>;
