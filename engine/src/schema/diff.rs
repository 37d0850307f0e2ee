// In engine/src/schema/diff.rs
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{SchemaSnapshot, TableSnapshot};

/// Direction is always "next relative to the altered previous schema".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    /// Present in next, missing after the alter.
    Added,
    /// Present after the alter, missing in next.
    Deleted,
    Changed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDiff {
    /// `column`, `primary_key`, `index` or `foreign_key`.
    pub target: String,
    pub name: String,
    pub kind: DiffKind,
    pub next: Option<Value>,
    pub previous: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDiff {
    pub table: String,
    pub kind: DiffKind,
    pub items: Vec<ItemDiff>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffReport {
    pub has_diff: bool,
    pub diffed_at: DateTime<Utc>,
    pub next_table_count: usize,
    pub previous_table_count: usize,
    pub tables: Vec<TableDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub craft_metadata: Option<Value>,
}

impl DiffReport {
    /// Next table count minus altered previous table count.
    pub fn table_count_delta(&self) -> i64 {
        self.next_table_count as i64 - self.previous_table_count as i64
    }

    pub fn with_craft_metadata(mut self, metadata: Value) -> Self {
        self.craft_metadata = Some(metadata);
        self
    }

    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "tables: next={} previous={} (delta {:+})",
            self.next_table_count,
            self.previous_table_count,
            self.table_count_delta()
        )];
        for table in &self.tables {
            lines.push(format!("{} table {}", kind_label(table.kind), table.table));
            for item in &table.items {
                lines.push(format!(
                    "  {} {} {}",
                    kind_label(item.kind),
                    item.target,
                    item.name
                ));
            }
        }
        lines
    }
}

fn kind_label(kind: DiffKind) -> &'static str {
    match kind {
        DiffKind::Added => "[+]",
        DiffKind::Deleted => "[-]",
        DiffKind::Changed => "[*]",
    }
}

/// Compares `next` against the altered `previous` by identity keys.
pub fn diff_schemas(next: &SchemaSnapshot, previous: &SchemaSnapshot) -> DiffReport {
    let names: BTreeSet<&String> = next.tables.keys().chain(previous.tables.keys()).collect();
    let mut tables = Vec::new();
    for name in names {
        match (next.tables.get(name), previous.tables.get(name)) {
            (Some(next_table), Some(previous_table)) => {
                let items = diff_table(next_table, previous_table);
                if !items.is_empty() {
                    tables.push(TableDiff {
                        table: name.clone(),
                        kind: DiffKind::Changed,
                        items,
                    });
                }
            }
            (Some(_), None) => tables.push(TableDiff {
                table: name.clone(),
                kind: DiffKind::Added,
                items: Vec::new(),
            }),
            (None, Some(_)) => tables.push(TableDiff {
                table: name.clone(),
                kind: DiffKind::Deleted,
                items: Vec::new(),
            }),
            (None, None) => {}
        }
    }

    DiffReport {
        has_diff: !tables.is_empty(),
        diffed_at: Utc::now(),
        next_table_count: next.table_count(),
        previous_table_count: previous.table_count(),
        tables,
        craft_metadata: None,
    }
}

fn diff_table(next: &TableSnapshot, previous: &TableSnapshot) -> Vec<ItemDiff> {
    let mut items = Vec::new();
    diff_map("column", &next.columns, &previous.columns, &mut items);
    if next.primary_key != previous.primary_key {
        items.push(ItemDiff {
            target: "primary_key".to_string(),
            name: next.primary_key.join(","),
            kind: DiffKind::Changed,
            next: serde_json::to_value(&next.primary_key).ok(),
            previous: serde_json::to_value(&previous.primary_key).ok(),
        });
    }
    diff_map("index", &next.indexes, &previous.indexes, &mut items);
    diff_map("foreign_key", &next.foreign_keys, &previous.foreign_keys, &mut items);
    items
}

fn diff_map<T>(
    target: &str,
    next: &BTreeMap<String, T>,
    previous: &BTreeMap<String, T>,
    items: &mut Vec<ItemDiff>,
) where
    T: PartialEq + Serialize,
{
    let keys: BTreeSet<&String> = next.keys().chain(previous.keys()).collect();
    for key in keys {
        let (next_item, previous_item) = (next.get(key), previous.get(key));
        let kind = match (next_item, previous_item) {
            (Some(a), Some(b)) if a == b => continue,
            (Some(_), Some(_)) => DiffKind::Changed,
            (Some(_), None) => DiffKind::Added,
            (None, Some(_)) => DiffKind::Deleted,
            (None, None) => continue,
        };
        items.push(ItemDiff {
            target: target.to_string(),
            name: key.clone(),
            kind,
            next: next_item.and_then(|item| serde_json::to_value(item).ok()),
            previous: previous_item.and_then(|item| serde_json::to_value(item).ok()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSnapshot, IndexSnapshot};

    fn column(name: &str, data_type: &str) -> ColumnSnapshot {
        ColumnSnapshot {
            name: name.to_string(),
            data_type: data_type.to_string(),
            not_null: false,
            default_value: None,
        }
    }

    fn table(name: &str, columns: &[ColumnSnapshot]) -> TableSnapshot {
        let mut table = TableSnapshot {
            name: name.to_string(),
            ..TableSnapshot::default()
        };
        for column in columns {
            table.columns.insert(column.name.to_lowercase(), column.clone());
        }
        table
    }

    fn schema(tables: Vec<TableSnapshot>) -> SchemaSnapshot {
        SchemaSnapshot {
            captured_at: None,
            tables: tables
                .into_iter()
                .map(|table| (table.name.to_lowercase(), table))
                .collect(),
        }
    }

    #[test]
    fn identical_schemas_have_no_diff() {
        let next = schema(vec![table("member", &[column("id", "INTEGER")])]);
        let report = diff_schemas(&next, &next.clone());
        assert!(!report.has_diff);
        assert_eq!(report.table_count_delta(), 0);
    }

    #[test]
    fn craft_metadata_is_passed_through_untouched() -> anyhow::Result<()> {
        let next = schema(vec![table("member", &[column("id", "INTEGER")])]);
        let plain = serde_json::to_value(diff_schemas(&next, &schema(vec![])))?;
        assert!(plain.get("craft_metadata").is_none());

        let metadata = serde_json::json!({ "owner": "billing", "checks": [1, 2] });
        let report = diff_schemas(&next, &schema(vec![])).with_craft_metadata(metadata.clone());
        let written = serde_json::to_string(&report)?;
        let read: DiffReport = serde_json::from_str(&written)?;
        assert_eq!(read.craft_metadata, Some(metadata));
        assert_eq!(read.tables, report.tables);
        Ok(())
    }

    #[test]
    fn declaration_order_does_not_matter() {
        let a = column("id", "INTEGER");
        let b = column("name", "TEXT");
        let mut next_member = table("member", &[a.clone(), b.clone()]);
        next_member.indexes.insert(
            "ix_member_name".to_string(),
            IndexSnapshot {
                name: "ix_member_name".to_string(),
                unique: false,
                columns: vec!["name".to_string()],
            },
        );
        let mut previous_member = table("member", &[b, a]);
        previous_member.indexes = next_member.indexes.clone();

        let next = schema(vec![next_member, table("purchase", &[])]);
        let previous = schema(vec![table("purchase", &[]), previous_member]);
        assert!(!diff_schemas(&next, &previous).has_diff);
    }

    #[test]
    fn reports_missing_table_and_column_level_changes() {
        let next = schema(vec![
            table("member", &[column("id", "INTEGER"), column("email", "TEXT")]),
            table("purchase", &[column("id", "INTEGER")]),
        ]);
        let previous = schema(vec![table(
            "member",
            &[column("id", "BIGINT"), column("legacy", "TEXT")],
        )]);

        let report = diff_schemas(&next, &previous);
        assert!(report.has_diff);
        assert_eq!(report.table_count_delta(), 1);
        assert_eq!(report.tables.len(), 2);

        let member = &report.tables[0];
        assert_eq!(member.kind, DiffKind::Changed);
        let kinds: Vec<(&str, DiffKind)> = member
            .items
            .iter()
            .map(|item| (item.name.as_str(), item.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("email", DiffKind::Added),
                ("id", DiffKind::Changed),
                ("legacy", DiffKind::Deleted),
            ]
        );
        assert_eq!(report.tables[1].table, "purchase");
        assert_eq!(report.tables[1].kind, DiffKind::Added);

        let summary = report.summary_lines().join("\n");
        assert!(summary.contains("delta +1"));
        assert!(summary.contains("[+] column email"));
    }
}
