// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL durable backend for counters.
//!
//! One row per counter, one BIGINT column per counter field. The mapping is
//! declared up front with a [`CounterSchema`] instead of being discovered at
//! runtime:
//!
//! ```rust
//! use counter_cache::CounterSchema;
//!
//! let schema = CounterSchema::new("post_stats", "post_id")
//!     .column("views", "view_count", 0)
//!     .column("likes", "like_count", 0);
//! assert_eq!(schema.defaults()["views"], 0);
//! ```
//!
//! produces
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS post_stats (
//!   post_id VARCHAR(255) PRIMARY KEY,
//!   view_count BIGINT NOT NULL DEFAULT 0,
//!   like_count BIGINT NOT NULL DEFAULT 0
//! )
//! ```
//!
//! A missing row loads as the schema defaults: every counter has a defined
//! zero state. Fields not in the schema are skipped on store.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use tracing::{debug, warn};

use super::traits::{CounterArchive, Fields, StorageError};
use crate::counter::keys::is_reserved;
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

#[inline]
fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// One counter field stored in one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub field: String,
    pub column: String,
    pub default: i64,
}

/// Declarative table mapping for a counter family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSchema {
    table: String,
    id_column: String,
    columns: Vec<ColumnSpec>,
}

impl CounterSchema {
    pub fn new(table: &str, id_column: &str) -> Self {
        Self {
            table: table.to_string(),
            id_column: id_column.to_string(),
            columns: Vec::new(),
        }
    }

    /// Map counter field `field` to `column`, loading as `default` when no row exists.
    #[must_use]
    pub fn column(mut self, field: &str, column: &str, default: i64) -> Self {
        self.columns.push(ColumnSpec {
            field: field.to_string(),
            column: column.to_string(),
            default,
        });
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// The seed a counter without a row starts from.
    pub fn defaults(&self) -> Fields {
        self.columns.iter().map(|c| (c.field.clone(), c.default)).collect()
    }

    /// Column values in schema order; absent fields take their default.
    pub fn to_row(&self, fields: &Fields) -> Vec<i64> {
        self.columns
            .iter()
            .map(|c| fields.get(&c.field).copied().unwrap_or(c.default))
            .collect()
    }

    /// Fields the schema does not know about (they are not persisted).
    pub fn unmapped<'a>(&self, fields: &'a Fields) -> Vec<&'a str> {
        fields
            .keys()
            .filter(|name| !self.columns.iter().any(|c| &c.field == *name))
            .map(String::as_str)
            .collect()
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.columns.is_empty() {
            return Err(StorageError::InvalidArgument(format!(
                "schema for '{}' has no columns",
                self.table
            )));
        }
        for ident in [&self.table, &self.id_column]
            .into_iter()
            .chain(self.columns.iter().map(|c| &c.column))
        {
            if !is_identifier(ident) {
                return Err(StorageError::InvalidArgument(format!(
                    "'{}' is not a valid SQL identifier",
                    ident
                )));
            }
        }
        for (i, spec) in self.columns.iter().enumerate() {
            if spec.field.is_empty() || is_reserved(&spec.field) {
                return Err(StorageError::InvalidArgument(format!(
                    "'{}' is not a valid counter field",
                    spec.field
                )));
            }
            if self.columns[..i]
                .iter()
                .any(|c| c.field == spec.field || c.column == spec.column)
            {
                return Err(StorageError::InvalidArgument(format!(
                    "field '{}' or column '{}' mapped twice",
                    spec.field, spec.column
                )));
            }
        }
        Ok(())
    }

    fn column_list(&self) -> String {
        self.columns.iter().map(|c| c.column.as_str()).collect::<Vec<_>>().join(", ")
    }

    fn create_table_sql(&self, is_sqlite: bool) -> String {
        let id_type = if is_sqlite { "TEXT" } else { "VARCHAR(255)" };
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} BIGINT NOT NULL DEFAULT {}", c.column, c.default))
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({} {} PRIMARY KEY, {})",
            self.table,
            self.id_column,
            id_type,
            columns.join(", ")
        )
    }

    fn select_sql(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} = ?",
            self.column_list(),
            self.table,
            self.id_column
        )
    }

    fn upsert_sql(&self, is_sqlite: bool) -> String {
        let placeholders = vec!["?"; self.columns.len() + 1].join(", ");
        let updates: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                if is_sqlite {
                    format!("{0} = excluded.{0}", c.column)
                } else {
                    format!("{0} = VALUES({0})", c.column)
                }
            })
            .collect();
        let conflict = if is_sqlite {
            format!("ON CONFLICT({}) DO UPDATE SET", self.id_column)
        } else {
            "ON DUPLICATE KEY UPDATE".to_string()
        };
        format!(
            "INSERT INTO {} ({}, {}) VALUES ({}) {} {}",
            self.table,
            self.id_column,
            self.column_list(),
            placeholders,
            conflict,
            updates.join(", ")
        )
    }

    fn delete_sql(&self) -> String {
        format!("DELETE FROM {} WHERE {} = ?", self.table, self.id_column)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// SQLite / MySQL counter table behind an `AnyPool`.
pub struct SqlCounterArchive {
    pool: AnyPool,
    schema: CounterSchema,
    select_sql: String,
    upsert_sql: String,
    delete_sql: String,
}

impl SqlCounterArchive {
    /// Connect with startup-mode retry and create the table if needed.
    pub async fn new(connection_string: &str, schema: CounterSchema) -> Result<Self, StorageError> {
        schema.validate()?;
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
        })
        .await
        .map_err(backend_err)?;

        if is_sqlite {
            // Readers don't block the scanner's writes
            sqlx::query("PRAGMA journal_mode = WAL")
                .execute(&pool)
                .await
                .map_err(backend_err)?;
        }

        let create = schema.create_table_sql(is_sqlite);
        sqlx::query(&create).execute(&pool).await.map_err(backend_err)?;

        Ok(Self {
            select_sql: schema.select_sql(),
            upsert_sql: schema.upsert_sql(is_sqlite),
            delete_sql: schema.delete_sql(),
            pool,
            schema,
        })
    }

    pub fn schema(&self) -> &CounterSchema {
        &self.schema
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }
}

#[async_trait]
impl CounterArchive for SqlCounterArchive {
    async fn load(&self, id: &str) -> Result<Fields, StorageError> {
        let row = sqlx::query(&self.select_sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;

        let Some(row) = row else {
            debug!(counter_id = %id, "No row, loading schema defaults");
            return Ok(self.schema.defaults());
        };

        let mut fields = Fields::with_capacity(self.schema.columns.len());
        for (i, spec) in self.schema.columns.iter().enumerate() {
            let value: i64 = row.try_get(i).map_err(backend_err)?;
            fields.insert(spec.field.clone(), value);
        }
        Ok(fields)
    }

    async fn store(&self, id: &str, fields: &Fields) -> Result<(), StorageError> {
        let unmapped = self.schema.unmapped(fields);
        if !unmapped.is_empty() {
            warn!(counter_id = %id, fields = ?unmapped, "Fields not in schema are not persisted");
        }

        let mut query = sqlx::query(&self.upsert_sql).bind(id);
        for value in self.schema.to_row(fields) {
            query = query.bind(value);
        }
        query.execute(&self.pool).await.map_err(backend_err)?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(&self.delete_sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> CounterSchema {
        CounterSchema::new("post_stats", "post_id")
            .column("views", "view_count", 0)
            .column("likes", "like_count", 5)
    }

    fn sqlite_url(name: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("counter_cache_{}_{}.db", name, nanos));
        format!("sqlite:{}?mode=rwc", path.display())
    }

    #[test]
    fn test_generated_sql() {
        let schema = schema();
        assert_eq!(
            schema.select_sql(),
            "SELECT view_count, like_count FROM post_stats WHERE post_id = ?"
        );
        assert_eq!(
            schema.upsert_sql(true),
            "INSERT INTO post_stats (post_id, view_count, like_count) VALUES (?, ?, ?) \
             ON CONFLICT(post_id) DO UPDATE SET view_count = excluded.view_count, like_count = excluded.like_count"
        );
        assert!(schema.upsert_sql(false).contains("ON DUPLICATE KEY UPDATE view_count = VALUES(view_count)"));
        assert!(schema.create_table_sql(false).contains("post_id VARCHAR(255) PRIMARY KEY"));
    }

    #[test]
    fn test_row_mapping() {
        let schema = schema();
        let fields: Fields = [("views".to_string(), 9), ("extra".to_string(), 1)].into();
        assert_eq!(schema.to_row(&fields), vec![9, 5]);
        assert_eq!(schema.unmapped(&fields), vec!["extra"]);
        assert_eq!(schema.defaults().len(), 2);
    }

    #[test]
    fn test_schema_validation() {
        assert!(schema().validate().is_ok());
        assert!(CounterSchema::new("t", "id").validate().is_err());
        assert!(CounterSchema::new("t; DROP", "id").column("a", "a", 0).validate().is_err());
        assert!(CounterSchema::new("t", "id").column("_w", "w", 0).validate().is_err());
        assert!(CounterSchema::new("t", "id")
            .column("a", "col", 0)
            .column("b", "col", 0)
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let archive = SqlCounterArchive::new(&sqlite_url("round_trip"), schema())
            .await
            .unwrap();

        // Missing row → defaults
        let seed = archive.load("p1").await.unwrap();
        assert_eq!(seed["views"], 0);
        assert_eq!(seed["likes"], 5);

        let fields: Fields = [("views".to_string(), 12), ("likes".to_string(), 7)].into();
        archive.store("p1", &fields).await.unwrap();
        assert_eq!(archive.load("p1").await.unwrap(), fields);

        // Upsert overwrites
        let fields: Fields = [("views".to_string(), 13), ("likes".to_string(), 7)].into();
        archive.store("p1", &fields).await.unwrap();
        assert_eq!(archive.load("p1").await.unwrap()["views"], 13);

        assert!(archive.delete("p1").await.unwrap());
        assert!(!archive.delete("p1").await.unwrap());
    }
}
