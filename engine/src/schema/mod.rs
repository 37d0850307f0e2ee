// In engine/src/schema/mod.rs
//!
//! Structural schema snapshots and their comparison.
//!
//! Every collection is keyed by identity (lowercased name, or a derived key
//! for unnamed constraints) so comparisons never depend on declaration
//! order. Column ordinal position is deliberately not captured.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

mod adapter;
mod diff;
mod sqlite;

pub use adapter::SnapshotAdapter;
pub use diff::{diff_schemas, DiffKind, DiffReport, ItemDiff, TableDiff};
pub use sqlite::SqliteInspector;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub captured_at: Option<DateTime<Utc>>,
    pub tables: BTreeMap<String, TableSnapshot>,
}

impl SchemaSnapshot {
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub name: String,
    pub columns: BTreeMap<String, ColumnSnapshot>,
    pub primary_key: Vec<String>,
    pub indexes: BTreeMap<String, IndexSnapshot>,
    pub foreign_keys: BTreeMap<String, ForeignKeySnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSnapshot {
    pub name: String,
    /// Declared type, uppercased.
    pub data_type: String,
    pub not_null: bool,
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    /// Lowercased index name, or `unique(<columns>)` for constraint indexes.
    pub name: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeySnapshot {
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    pub on_update: String,
    pub on_delete: String,
}

impl ForeignKeySnapshot {
    pub fn identity(&self) -> String {
        format!(
            "{}->{}({})",
            self.columns.join(","),
            self.referenced_table,
            self.referenced_columns.join(",")
        )
    }
}

/// Reads the structure of the live schema.
pub trait SchemaInspector {
    fn snapshot(&self) -> anyhow::Result<SchemaSnapshot>;
}
