//! Small accessors bson doesn't provide.
use bson::document::{ValueAccessError, ValueAccessResult};
use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document, Timestamp};
use uuid::Uuid;

/// Get a uuid value for this `key` if it exists and has the correct type for given `doc`.
pub fn get_uuid(doc: &Document, key: &str) -> ValueAccessResult<Uuid> {
    match doc.get(key) {
        Some(Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes,
        })) => Uuid::from_slice(bytes).map_err(|_| ValueAccessError::UnexpectedType),
        Some(_) => Err(ValueAccessError::UnexpectedType),
        None => Err(ValueAccessError::NotPresent),
    }
}

/// Like [get_uuid], but a missing key is not an error.
pub fn get_optional_uuid(doc: &Document, key: &str) -> ValueAccessResult<Option<Uuid>> {
    match get_uuid(doc, key) {
        Ok(uuid) => Ok(Some(uuid)),
        Err(ValueAccessError::NotPresent) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Create a new bson::Binary from given `uuid`.
pub fn new_binary(uuid: Uuid) -> Binary {
    Binary {
        subtype: BinarySubtype::Uuid,
        bytes: uuid.as_bytes().to_vec(),
    }
}

/// Read an optional sub document.
pub fn get_optional_document<'a>(
    doc: &'a Document,
    key: &str,
) -> ValueAccessResult<Option<&'a Document>> {
    match doc.get_document(key) {
        Ok(d) => Ok(Some(d)),
        Err(ValueAccessError::NotPresent) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Read an optional integer, accepting both int32 and int64.
pub fn get_optional_i64(doc: &Document, key: &str) -> ValueAccessResult<Option<i64>> {
    match doc.get(key) {
        Some(Bson::Int64(v)) => Ok(Some(*v)),
        Some(Bson::Int32(v)) => Ok(Some(*v as i64)),
        Some(_) => Err(ValueAccessError::UnexpectedType),
        None => Ok(None),
    }
}

/// Read the `ts` of an optime sub document like `{ts: Timestamp, t: 1}`.
pub fn get_optime_ts(doc: &Document, key: &str) -> ValueAccessResult<Option<Timestamp>> {
    match get_optional_document(doc, key)? {
        Some(optime) => Ok(Some(optime.get_timestamp("ts")?)),
        None => Ok(None),
    }
}

/// `true` for a flag that is present and truthy.
pub fn get_flag(doc: &Document, key: &str) -> bool {
    match doc.get(key) {
        Some(Bson::Boolean(b)) => *b,
        Some(Bson::Int32(v)) => *v != 0,
        Some(Bson::Int64(v)) => *v != 0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_uuid_round_trip_through_binary() {
        let uuid = Uuid::parse_str("c050283e-3641-4d79-8e82-6665b7a4d19b").unwrap();
        let d = doc! {"ui": new_binary(uuid)};
        assert_eq!(get_uuid(&d, "ui").unwrap(), uuid);
        assert_eq!(get_optional_uuid(&doc! {}, "ui").unwrap(), None);
    }

    #[test]
    fn test_get_uuid_wrong_type() {
        let d = doc! {"ui": "not a uuid"};
        assert!(matches!(
            get_uuid(&d, "ui"),
            Err(ValueAccessError::UnexpectedType)
        ));
    }
}
