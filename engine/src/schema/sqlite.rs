// In engine/src/schema/sqlite.rs
use std::collections::BTreeMap;

use anyhow::Context;
use chrono::Utc;
use rusqlite::Connection;

use super::{
    ColumnSnapshot, ForeignKeySnapshot, IndexSnapshot, SchemaInspector, SchemaSnapshot,
    TableSnapshot,
};
use crate::DbPool;

#[derive(Clone)]
pub struct SqliteInspector {
    pool: DbPool,
}

impl SqliteInspector {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl SchemaInspector for SqliteInspector {
    fn snapshot(&self) -> anyhow::Result<SchemaSnapshot> {
        let conn = self.pool.get().context("failed to get a database connection")?;
        let mut snapshot = SchemaSnapshot {
            captured_at: Some(Utc::now()),
            tables: BTreeMap::new(),
        };
        for name in table_names(&conn)? {
            let table = read_table(&conn, &name)
                .with_context(|| format!("failed to inspect table {name}"))?;
            snapshot.tables.insert(name.to_lowercase(), table);
        }
        Ok(snapshot)
    }
}

fn table_names(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

fn read_table(conn: &Connection, name: &str) -> rusqlite::Result<TableSnapshot> {
    let mut table = TableSnapshot {
        name: name.to_string(),
        ..TableSnapshot::default()
    };

    let mut primary_key: Vec<(i64, String)> = Vec::new();
    {
        let mut stmt =
            conn.prepare("SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1)")?;
        let mut rows = stmt.query([name])?;
        while let Some(row) = rows.next()? {
            let column_name: String = row.get(0)?;
            let data_type: String = row.get(1)?;
            let pk: i64 = row.get(4)?;
            if pk > 0 {
                primary_key.push((pk, column_name.to_lowercase()));
            }
            table.columns.insert(
                column_name.to_lowercase(),
                ColumnSnapshot {
                    name: column_name,
                    data_type: data_type.to_uppercase(),
                    not_null: row.get::<_, i64>(2)? != 0,
                    default_value: row.get(3)?,
                },
            );
        }
    }
    primary_key.sort();
    table.primary_key = primary_key.into_iter().map(|(_, column)| column).collect();

    let indexes: Vec<(String, bool, String)> = {
        let mut stmt =
            conn.prepare("SELECT name, \"unique\", origin FROM pragma_index_list(?1)")?;
        let rows = stmt.query_map([name], |row| {
            Ok((row.get(0)?, row.get::<_, i64>(1)? != 0, row.get(2)?))
        })?;
        rows.collect::<Result<_, _>>()?
    };
    for (index_name, unique, origin) in indexes {
        // The primary key is compared separately.
        if origin == "pk" {
            continue;
        }
        let columns = index_columns(conn, &index_name)?;
        // Auto-index names are numbered by declaration order.
        let name = if origin == "u" || index_name.starts_with("sqlite_autoindex_") {
            format!("unique({})", columns.join(","))
        } else {
            index_name.to_lowercase()
        };
        table.indexes.insert(
            name.clone(),
            IndexSnapshot {
                name,
                unique,
                columns,
            },
        );
    }

    let mut foreign_keys: BTreeMap<i64, ForeignKeySnapshot> = BTreeMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT id, \"table\", \"from\", \"to\", on_update, on_delete
             FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
        )?;
        let mut rows = stmt.query([name])?;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let referenced_table: String = row.get(1)?;
            let from: String = row.get(2)?;
            let to: Option<String> = row.get(3)?;
            let entry = foreign_keys.entry(id).or_insert_with(|| ForeignKeySnapshot {
                columns: Vec::new(),
                referenced_table: referenced_table.to_lowercase(),
                referenced_columns: Vec::new(),
                on_update: String::new(),
                on_delete: String::new(),
            });
            entry.columns.push(from.to_lowercase());
            entry
                .referenced_columns
                .push(to.unwrap_or_default().to_lowercase());
            entry.on_update = row.get(4)?;
            entry.on_delete = row.get(5)?;
        }
    }
    for foreign_key in foreign_keys.into_values() {
        table.foreign_keys.insert(foreign_key.identity(), foreign_key);
    }

    Ok(table)
}

fn index_columns(conn: &Connection, index: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
    let columns = stmt
        .query_map([index], |row| row.get::<_, Option<String>>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns
        .into_iter()
        .map(|column| column.unwrap_or_else(|| "<expr>".to_string()).to_lowercase())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::diff_schemas;
    use r2d2_sqlite::SqliteConnectionManager;
    use tempfile::TempDir;

    #[test]
    fn captures_columns_keys_indexes_and_foreign_keys() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let manager = SqliteConnectionManager::file(temp_dir.path().join("inspect.sqlite"));
        let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
        pool.get()?.execute_batch(
            "CREATE TABLE member (
                 member_id INTEGER PRIMARY KEY,
                 email varchar(200) NOT NULL UNIQUE,
                 status TEXT DEFAULT 'active'
             );
             CREATE TABLE purchase (
                 purchase_id INTEGER,
                 member_id INTEGER REFERENCES member(member_id) ON DELETE CASCADE,
                 PRIMARY KEY (purchase_id, member_id)
             );
             CREATE INDEX ix_purchase_member ON purchase(member_id);",
        )?;

        let snapshot = SqliteInspector::new(pool).snapshot()?;
        assert_eq!(snapshot.table_count(), 2);

        let member = &snapshot.tables["member"];
        assert_eq!(member.primary_key, vec!["member_id"]);
        assert_eq!(member.columns["email"].data_type, "VARCHAR(200)");
        assert!(member.columns["email"].not_null);
        assert_eq!(
            member.columns["status"].default_value.as_deref(),
            Some("'active'")
        );
        assert!(member.indexes.contains_key("unique(email)"));

        assert_eq!(member.indexes["unique(email)"].name, "unique(email)");

        let purchase = &snapshot.tables["purchase"];
        assert_eq!(purchase.primary_key, vec!["purchase_id", "member_id"]);
        assert!(purchase.indexes.contains_key("ix_purchase_member"));
        let foreign_key = &purchase.foreign_keys["member_id->member(member_id)"];
        assert_eq!(foreign_key.on_delete, "CASCADE");
        Ok(())
    }

    fn snapshot_of(temp_dir: &TempDir, file: &str, sql: &str) -> anyhow::Result<SchemaSnapshot> {
        let manager = SqliteConnectionManager::file(temp_dir.path().join(file));
        let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
        pool.get()?.execute_batch(sql)?;
        SqliteInspector::new(pool).snapshot()
    }

    #[test]
    fn unique_constraint_order_does_not_matter() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let first = snapshot_of(
            &temp_dir,
            "first.sqlite",
            "CREATE TABLE t (a TEXT UNIQUE, b TEXT UNIQUE, c TEXT, UNIQUE (b, c));",
        )?;
        let second = snapshot_of(
            &temp_dir,
            "second.sqlite",
            "CREATE TABLE t (c TEXT, b TEXT UNIQUE, a TEXT UNIQUE, UNIQUE (b, c));",
        )?;

        let report = diff_schemas(&first, &second);
        assert!(!report.has_diff, "{:?}", report.summary_lines());
        assert!(first.tables["t"].indexes.contains_key("unique(b,c)"));
        Ok(())
    }

    #[test]
    fn index_name_case_does_not_matter() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let upper = snapshot_of(
            &temp_dir,
            "upper.sqlite",
            "CREATE TABLE t (a TEXT); CREATE INDEX IX_T_A ON t(a);",
        )?;
        let lower = snapshot_of(
            &temp_dir,
            "lower.sqlite",
            "CREATE TABLE t (a TEXT); CREATE INDEX ix_t_a ON t(a);",
        )?;

        assert!(!diff_schemas(&upper, &lower).has_diff);
        assert_eq!(upper.tables["t"].indexes["ix_t_a"].name, "ix_t_a");
        Ok(())
    }
}
