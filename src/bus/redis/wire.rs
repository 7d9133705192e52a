//! Parsing of raw Redis stream replies
//!
//! Field lists come back as a flat `[k, v, k, v]` array, an array of
//! `[k, v]` pairs, or a RESP3 map depending on protocol and client. Entries
//! that match none of these are skipped and counted, never fatal.

use redis::Value;
use tracing::warn;

use crate::bus::stream::{PendingEntry, StreamBatch, StreamEntry};

/// Parse an `XREADGROUP` reply covering one or more streams
pub fn parse_read_reply(value: Value) -> StreamBatch {
    let mut batch = StreamBatch::default();

    let streams: Vec<(Value, Value)> = match value {
        Value::Nil => return batch,
        Value::Array(items) => {
            let mut pairs = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Array(mut pair) if pair.len() == 2 => {
                        let entries = pair.pop().unwrap_or(Value::Nil);
                        let name = pair.pop().unwrap_or(Value::Nil);
                        pairs.push((name, entries));
                    }
                    other => {
                        warn!("Skipping stream block with unexpected shape: {:?}", other);
                        batch.skipped += 1;
                    }
                }
            }
            pairs
        }
        Value::Map(pairs) => pairs,
        other => {
            warn!("Unexpected XREADGROUP reply shape: {:?}", other);
            batch.skipped += 1;
            return batch;
        }
    };

    for (_name, entries) in streams {
        let parsed = parse_entries(entries);
        batch.entries.extend(parsed.entries);
        batch.skipped += parsed.skipped;
    }

    batch
}

/// Parse a list of `[id, fields]` entries, as returned by `XCLAIM` and per stream by `XREADGROUP`
pub fn parse_entries(value: Value) -> StreamBatch {
    let mut batch = StreamBatch::default();

    let items = match value {
        Value::Nil => return batch,
        Value::Array(items) => items,
        other => {
            warn!("Expected an entry list, got {:?}", other);
            batch.skipped += 1;
            return batch;
        }
    };

    for item in items {
        match parse_entry(item) {
            Some(entry) => batch.entries.push(entry),
            None => batch.skipped += 1,
        }
    }

    batch
}

fn parse_entry(value: Value) -> Option<StreamEntry> {
    let mut parts = match value {
        Value::Array(parts) if parts.len() == 2 => parts,
        other => {
            warn!("Skipping stream entry with unexpected shape: {:?}", other);
            return None;
        }
    };

    let fields_value = parts.pop()?;
    let id = match as_string(&parts[0]) {
        Some(id) => id,
        None => {
            warn!("Skipping stream entry without a readable id: {:?}", parts[0]);
            return None;
        }
    };

    match parse_fields(fields_value) {
        Some(fields) => Some(StreamEntry { id, fields }),
        None => {
            warn!("Skipping stream entry {} with malformed field list", id);
            None
        }
    }
}

fn parse_fields(value: Value) -> Option<Vec<(String, Vec<u8>)>> {
    match value {
        Value::Map(pairs) => pairs
            .into_iter()
            .map(|(k, v)| Some((as_string(&k)?, as_bytes(v)?)))
            .collect(),
        Value::Array(items) => {
            let pair_shaped = !items.is_empty()
                && items
                    .iter()
                    .all(|item| matches!(item, Value::Array(pair) if pair.len() == 2));

            if pair_shaped {
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::Array(mut pair) => {
                            let v = pair.pop()?;
                            let k = pair.pop()?;
                            Some((as_string(&k)?, as_bytes(v)?))
                        }
                        _ => None,
                    })
                    .collect()
            } else if items.len() % 2 == 0 {
                let mut fields = Vec::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    fields.push((as_string(&k)?, as_bytes(v)?));
                }
                Some(fields)
            } else {
                None
            }
        }
        // Entry deleted by trimming while still pending
        Value::Nil => None,
        _ => None,
    }
}

/// Parse the extended form of `XPENDING key group - + count`
pub fn parse_pending(value: Value) -> (Vec<PendingEntry>, usize) {
    let mut entries = Vec::new();
    let mut skipped = 0;

    let items = match value {
        Value::Nil => return (entries, skipped),
        Value::Array(items) => items,
        other => {
            warn!("Unexpected XPENDING reply shape: {:?}", other);
            return (entries, 1);
        }
    };

    for item in items {
        let parsed = match &item {
            Value::Array(parts) if parts.len() == 4 => (|| {
                Some(PendingEntry {
                    id: as_string(&parts[0])?,
                    consumer: as_string(&parts[1])?,
                    idle_ms: as_u64(&parts[2])?,
                    deliveries: as_u64(&parts[3])?,
                })
            })(),
            _ => None,
        };

        match parsed {
            Some(entry) => entries.push(entry),
            None => {
                warn!("Skipping malformed pending entry: {:?}", item);
                skipped += 1;
            }
        }
    }

    (entries, skipped)
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn as_bytes(value: Value) -> Option<Vec<u8>> {
    match value {
        Value::BulkString(bytes) => Some(bytes),
        Value::SimpleString(s) => Some(s.into_bytes()),
        _ => None,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Int(n) if *n >= 0 => Some(*n as u64),
        Value::BulkString(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
        Value::SimpleString(s) => s.parse().ok(),
        _ => None,
    }
}
