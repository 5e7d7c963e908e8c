//! Conversions between oplog timestamps and wall clock time.
use bson::Timestamp;
use chrono::{DateTime, TimeZone, Utc};

/// Wall clock time of the second part of `ts`, used for logging and retention.
pub fn to_datetime(ts: &Timestamp) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.time as i64, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// The first timestamp of the second `dt` falls in.
pub fn from_datetime(dt: DateTime<Utc>) -> Timestamp {
    let secs = dt.timestamp().clamp(0, u32::MAX as i64);
    Timestamp {
        time: secs as u32,
        increment: 0,
    }
}

/// The smallest timestamp strictly after `ts`.
pub fn next_timestamp(ts: Timestamp) -> Timestamp {
    if ts.increment == u32::MAX {
        Timestamp {
            time: ts.time.saturating_add(1),
            increment: 0,
        }
    } else {
        Timestamp {
            time: ts.time,
            increment: ts.increment + 1,
        }
    }
}

/// Pack a timestamp into one integer with the same ordering.
pub fn pack(ts: Timestamp) -> u64 {
    ((ts.time as u64) << 32) | ts.increment as u64
}

/// Reverse of [pack].
pub fn unpack(packed: u64) -> Timestamp {
    Timestamp {
        time: (packed >> 32) as u32,
        increment: packed as u32,
    }
}

/// Compare two timestamps by seconds then increment.
pub fn cmp(a: &Timestamp, b: &Timestamp) -> std::cmp::Ordering {
    pack(*a).cmp(&pack(*b))
}
