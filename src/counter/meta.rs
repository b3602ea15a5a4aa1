// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Parsing raw counter hashes.

use thiserror::Error;

use super::keys::{is_reserved, SYNC_TIMESTAMP, SYNC_VERSION, WRITE_VERSION};
use crate::storage::traits::{Fields, RawFields, StorageError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetaError {
    #[error("missing metadata field {0}")]
    Missing(&'static str),
    #[error("field '{field}' is not an integer: '{value}'")]
    NotInteger { field: String, value: String },
}

impl MetaError {
    pub fn into_storage(self, key: &str) -> StorageError {
        StorageError::Corruption {
            key: key.to_string(),
            reason: self.to_string(),
        }
    }
}

/// A counter as read from the cache, metadata split out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub fields: Fields,
    pub write_version: i64,
    pub sync_version: i64,
    pub sync_timestamp: i64,
}

impl CounterSnapshot {
    /// `Ok(None)` for an empty (missing) hash; `Err` when metadata is
    /// incomplete or any value is not an integer.
    pub fn parse(raw: RawFields) -> Result<Option<Self>, MetaError> {
        if raw.is_empty() {
            return Ok(None);
        }

        let mut fields = Fields::with_capacity(raw.len());
        let mut write_version = None;
        let mut sync_version = None;
        let mut sync_timestamp = None;

        for (name, value) in raw {
            let parsed = parse_int(&name, &value)?;
            match name.as_str() {
                WRITE_VERSION => write_version = Some(parsed),
                SYNC_VERSION => sync_version = Some(parsed),
                SYNC_TIMESTAMP => sync_timestamp = Some(parsed),
                other if is_reserved(other) => {}
                _ => {
                    fields.insert(name, parsed);
                }
            }
        }

        Ok(Some(Self {
            fields,
            write_version: write_version.ok_or(MetaError::Missing(WRITE_VERSION))?,
            sync_version: sync_version.ok_or(MetaError::Missing(SYNC_VERSION))?,
            sync_timestamp: sync_timestamp.ok_or(MetaError::Missing(SYNC_TIMESTAMP))?,
        }))
    }

    /// Unpersisted changes exist.
    pub fn is_dirty(&self) -> bool {
        self.sync_version < self.write_version
    }
}

/// Caller-visible fields only; metadata is dropped without being validated.
pub fn visible_fields(raw: RawFields) -> Result<Fields, MetaError> {
    let mut fields = Fields::with_capacity(raw.len());
    for (name, value) in raw {
        if is_reserved(&name) {
            continue;
        }
        let parsed = parse_int(&name, &value)?;
        fields.insert(name, parsed);
    }
    Ok(fields)
}

fn parse_int(field: &str, value: &str) -> Result<i64, MetaError> {
    value.parse::<i64>().map_err(|_| MetaError::NotInteger {
        field: field.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> RawFields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_complete() {
        let snapshot = CounterSnapshot::parse(raw(&[
            ("a", "3"),
            ("b", "-4"),
            ("_w", "200"),
            ("_s", "100"),
            ("_st", "150"),
        ]))
        .unwrap()
        .unwrap();

        assert_eq!(snapshot.fields.len(), 2);
        assert_eq!(snapshot.fields["b"], -4);
        assert_eq!(snapshot.write_version, 200);
        assert!(snapshot.is_dirty());
    }

    #[test]
    fn test_parse_empty_is_none() {
        assert_eq!(CounterSnapshot::parse(vec![]), Ok(None));
    }

    #[test]
    fn test_parse_missing_metadata() {
        let err = CounterSnapshot::parse(raw(&[("a", "1"), ("_w", "5"), ("_st", "1")])).unwrap_err();
        assert_eq!(err, MetaError::Missing(SYNC_VERSION));
    }

    #[test]
    fn test_parse_non_integer() {
        let err = CounterSnapshot::parse(raw(&[("a", "x"), ("_w", "1"), ("_s", "1"), ("_st", "1")]))
            .unwrap_err();
        assert!(matches!(err, MetaError::NotInteger { .. }));
    }

    #[test]
    fn test_visible_fields_strips_metadata() {
        let fields = visible_fields(raw(&[("a", "1"), ("_w", "garbage")])).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["a"], 1);
    }

    #[test]
    fn test_clean_snapshot() {
        let snapshot = CounterSnapshot::parse(raw(&[("_w", "9"), ("_s", "9"), ("_st", "1")]))
            .unwrap()
            .unwrap();
        assert!(!snapshot.is_dirty());
        assert!(snapshot.fields.is_empty());
    }
}
