//! Schema introspector
//!
//! Enumerates tables, columns, indexes, and foreign keys from the live store
//! using engine-native catalog queries. Consumers: bootstrap idempotency
//! checks, DNA serialization, index analysis, and the binding generator.

use serde::{Deserialize, Serialize};

use crate::config::IntrospectionConfig;
use crate::error::Result;
use crate::sql::{quote_identifier, Identifier};
use crate::storage::Storage;

// ============================================================================
// SNAPSHOT TYPES
// ============================================================================

/// One column of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// Declared type as the engine reports it
    pub type_name: String,
    /// NULLs permitted
    pub nullable: bool,
    /// Default expression text, if any
    pub default: Option<String>,
    /// Part of the primary key
    pub pk: bool,
    /// Auto-increment rowid alias
    pub auto_increment: bool,
}

/// One index of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInfo {
    /// Index name
    pub name: String,
    /// Uniqueness
    pub unique: bool,
    /// Indexed columns in order
    pub columns: Vec<String>,
}

/// One outgoing foreign key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyInfo {
    /// Referencing column
    pub from_column: String,
    /// Referenced table
    pub ref_table: String,
    /// Referenced column (empty means the target's primary key)
    pub ref_column: String,
    /// ON DELETE behavior as reported ("CASCADE", "NO ACTION", ...)
    pub on_delete: String,
}

/// One table with its full shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    /// Table name
    pub name: String,
    /// Columns in definition order
    pub columns: Vec<ColumnInfo>,
    /// Named indexes, sorted by name (auto-indexes excluded)
    pub indexes: Vec<IndexInfo>,
    /// Outgoing foreign keys
    pub foreign_keys: Vec<ForeignKeyInfo>,
}

/// The introspected schema at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSnapshot {
    /// Tables sorted by name
    pub tables: Vec<TableInfo>,
    /// View names sorted (empty unless `include_views`)
    pub views: Vec<String>,
}

impl SchemaSnapshot {
    /// Look up a table by name.
    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// All table names in order.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// True when any table carries an index with this name.
    pub fn has_index(&self, index_name: &str) -> bool {
        self.tables
            .iter()
            .any(|t| t.indexes.iter().any(|i| i.name == index_name))
    }

    /// True when the table has an index whose leading column is `column`.
    pub fn has_leading_index(&self, table: &str, column: &str) -> bool {
        self.table(table)
            .map(|t| {
                t.indexes
                    .iter()
                    .any(|i| i.columns.first().map(String::as_str) == Some(column))
            })
            .unwrap_or(false)
    }
}

// ============================================================================
// INTROSPECTOR
// ============================================================================

/// Catalog reader over an open storage
pub struct Introspector<'a> {
    storage: &'a Storage,
    config: IntrospectionConfig,
}

impl<'a> Introspector<'a> {
    /// Wrap an open storage with default introspection behavior.
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage, config: IntrospectionConfig::default() }
    }

    /// Wrap with explicit behavior.
    pub fn with_config(storage: &'a Storage, config: IntrospectionConfig) -> Self {
        Self { storage, config }
    }

    /// Take a full schema snapshot.
    pub fn snapshot(&self) -> Result<SchemaSnapshot> {
        let mut names: Vec<(String, String)> = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, COALESCE(sql, '') FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        names.retain(|(name, _)| !self.config.exclude_tables.contains(name));

        let mut tables = Vec::with_capacity(names.len());
        for (name, create_sql) in names {
            let Ok(ident) = Identifier::new(name.as_str()) else {
                // Catalog rows we did not create and cannot safely re-quote
                tracing::warn!(table = %name, "skipping table with non-conforming name");
                continue;
            };
            tables.push(self.table_info(&ident, &create_sql)?);
        }

        let views = if self.config.include_views {
            self.storage.with_reader(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'view' ORDER BY name",
                )?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(rows)
            })?
        } else {
            Vec::new()
        };

        Ok(SchemaSnapshot { tables, views })
    }

    /// Shape of one table.
    pub fn table_info(&self, table: &Identifier, create_sql: &str) -> Result<TableInfo> {
        let quoted = quote_identifier(table);
        let has_autoinc = create_sql.to_ascii_uppercase().contains("AUTOINCREMENT");

        let columns = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({quoted})"))?;
            let rows = stmt
                .query_map([], |row| {
                    let name: String = row.get("name")?;
                    let type_name: String = row.get("type")?;
                    let notnull: i64 = row.get("notnull")?;
                    let default: Option<String> = row.get("dflt_value")?;
                    let pk: i64 = row.get("pk")?;
                    let auto = pk == 1 && has_autoinc && type_name.eq_ignore_ascii_case("integer");
                    Ok(ColumnInfo {
                        name,
                        type_name,
                        nullable: notnull == 0 && pk == 0,
                        default,
                        pk: pk > 0,
                        auto_increment: auto,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut index_heads: Vec<(String, bool)> = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!("PRAGMA index_list({quoted})"))?;
            let rows = stmt
                .query_map([], |row| {
                    let name: String = row.get("name")?;
                    let unique: i64 = row.get("unique")?;
                    Ok((name, unique == 1))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        // Auto-generated uniqueness indexes are an engine detail
        index_heads.retain(|(name, _)| !name.starts_with("sqlite_autoindex_"));
        index_heads.sort_by(|a, b| a.0.cmp(&b.0));

        let mut indexes = Vec::with_capacity(index_heads.len());
        for (index_name, unique) in index_heads {
            let Ok(index_ident) = Identifier::new(index_name.as_str()) else {
                continue;
            };
            let quoted_index = quote_identifier(&index_ident);
            let columns = self.storage.with_reader(|conn| {
                let mut stmt = conn.prepare(&format!("PRAGMA index_info({quoted_index})"))?;
                let rows = stmt
                    .query_map([], |row| {
                        let name: Option<String> = row.get("name")?;
                        Ok(name.unwrap_or_default())
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })?;
            indexes.push(IndexInfo { name: index_name, unique, columns });
        }

        let foreign_keys = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list({quoted})"))?;
            let rows = stmt
                .query_map([], |row| {
                    let ref_table: String = row.get("table")?;
                    let from_column: String = row.get("from")?;
                    let ref_column: Option<String> = row.get("to")?;
                    let on_delete: String = row.get("on_delete")?;
                    Ok(ForeignKeyInfo {
                        from_column,
                        ref_table,
                        ref_column: ref_column.unwrap_or_default(),
                        on_delete,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        Ok(TableInfo { name: table.as_str().to_string(), columns, indexes, foreign_keys })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionSettings, OptimizationConfig};

    fn storage_with_schema() -> Storage {
        let storage = Storage::open(
            &ConnectionSettings::Embedded { path: None },
            &OptimizationConfig::default(),
        )
        .unwrap();
        storage
            .with_writer(|conn| {
                conn.execute_batch(
                    "CREATE TABLE owners (
                         id INTEGER PRIMARY KEY AUTOINCREMENT,
                         name TEXT NOT NULL
                     );
                     CREATE TABLE pets (
                         id INTEGER PRIMARY KEY AUTOINCREMENT,
                         owner_id INTEGER NOT NULL REFERENCES owners(id) ON DELETE CASCADE,
                         nickname TEXT DEFAULT 'unnamed'
                     );
                     CREATE INDEX idx_pets_owner ON pets(owner_id);
                     CREATE UNIQUE INDEX idx_owners_name ON owners(name);
                     CREATE VIEW owner_names AS SELECT name FROM owners;",
                )
            })
            .unwrap();
        storage
    }

    #[test]
    fn snapshot_enumerates_tables_and_columns() {
        let storage = storage_with_schema();
        let snapshot = Introspector::new(&storage).snapshot().unwrap();
        assert_eq!(snapshot.table_names(), vec!["owners", "pets"]);

        let pets = snapshot.table("pets").unwrap();
        assert_eq!(pets.columns.len(), 3);
        let id = &pets.columns[0];
        assert!(id.pk && id.auto_increment && !id.nullable);
        let nickname = &pets.columns[2];
        assert!(nickname.nullable);
        assert_eq!(nickname.default.as_deref(), Some("'unnamed'"));
    }

    #[test]
    fn snapshot_reads_indexes_and_fks() {
        let storage = storage_with_schema();
        let snapshot = Introspector::new(&storage).snapshot().unwrap();

        let pets = snapshot.table("pets").unwrap();
        assert_eq!(pets.indexes.len(), 1);
        assert_eq!(pets.indexes[0].columns, vec!["owner_id"]);
        assert!(!pets.indexes[0].unique);
        assert_eq!(pets.foreign_keys.len(), 1);
        assert_eq!(pets.foreign_keys[0].ref_table, "owners");
        assert_eq!(pets.foreign_keys[0].on_delete, "CASCADE");

        let owners = snapshot.table("owners").unwrap();
        assert!(owners.indexes[0].unique);
        assert!(snapshot.has_leading_index("pets", "owner_id"));
        assert!(!snapshot.has_leading_index("pets", "nickname"));
    }

    #[test]
    fn views_only_when_requested() {
        let storage = storage_with_schema();
        let without = Introspector::new(&storage).snapshot().unwrap();
        assert!(without.views.is_empty());

        let config = IntrospectionConfig { include_views: true, ..Default::default() };
        let with = Introspector::with_config(&storage, config).snapshot().unwrap();
        assert_eq!(with.views, vec!["owner_names"]);
    }

    #[test]
    fn exclusions_are_honored() {
        let storage = storage_with_schema();
        let config = IntrospectionConfig {
            exclude_tables: vec!["owners".to_string()],
            ..Default::default()
        };
        let snapshot = Introspector::with_config(&storage, config).snapshot().unwrap();
        assert_eq!(snapshot.table_names(), vec!["pets"]);
    }

    #[test]
    fn snapshots_compare_equal_for_unchanged_schema() {
        let storage = storage_with_schema();
        let a = Introspector::new(&storage).snapshot().unwrap();
        let b = Introspector::new(&storage).snapshot().unwrap();
        assert_eq!(a, b);
    }
}
