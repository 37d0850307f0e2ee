// In engine/src/executor.rs
//!
//! SQL-file execution against the live database.
//!
//! Scripts are split into statements locally so a failure can be attributed
//! to the exact statement and file. A statement preceded by an
//! `-- @assert-empty` or `-- @assert-exists` comment is evaluated as a query
//! and fails when its row count contradicts the directive; take-finally
//! scripts use these to state what must hold after the alter.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Context;
use regex::Regex;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, warn};

use crate::DbPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AssertDirective {
    /// The query must return no rows.
    Empty,
    /// The query must return at least one row.
    Exists,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStatement {
    pub sql: String,
    pub directive: Option<AssertDirective>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatementFailure {
    pub file: PathBuf,
    pub statement: String,
    pub message: String,
    /// True when an assertion directive was violated rather than SQL failing.
    pub assertion: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScriptRunResult {
    /// Files opened in order; on failure the last one is the failing file.
    pub touched_files: Vec<PathBuf>,
    /// Real statements executed, comment-only chunks excluded.
    pub statement_count: usize,
    pub failures: Vec<StatementFailure>,
}

impl ScriptRunResult {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn first_failure(&self) -> Option<&StatementFailure> {
        self.failures.first()
    }
}

pub trait SqlExecutor {
    /// Runs `files` in order, stopping at the first failing statement.
    ///
    /// Statement failures are reported in the result; `Err` means the files
    /// could not be run at all.
    fn execute_files(&self, files: &[PathBuf]) -> anyhow::Result<ScriptRunResult>;
}

#[derive(Clone)]
pub struct SqliteExecutor {
    pool: DbPool,
}

impl SqliteExecutor {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn run_statement(
        conn: &Connection,
        statement: &SqlStatement,
    ) -> Result<(), (String, bool)> {
        let mut prepared = conn
            .prepare(&statement.sql)
            .map_err(|err| (err.to_string(), false))?;

        if let Some(directive) = statement.directive {
            let mut rows = prepared.query([]).map_err(|err| (err.to_string(), false))?;
            let mut count = 0usize;
            while rows.next().map_err(|err| (err.to_string(), false))?.is_some() {
                count += 1;
            }
            return match directive {
                AssertDirective::Empty if count > 0 => Err((
                    format!("expected no rows but the query returned {count}"),
                    true,
                )),
                AssertDirective::Exists if count == 0 => Err((
                    "expected at least one row but the query returned none".to_string(),
                    true,
                )),
                _ => Ok(()),
            };
        }

        if prepared.column_count() > 0 {
            let mut rows = prepared.query([]).map_err(|err| (err.to_string(), false))?;
            while rows.next().map_err(|err| (err.to_string(), false))?.is_some() {}
        } else {
            prepared.execute([]).map_err(|err| (err.to_string(), false))?;
        }
        Ok(())
    }
}

impl SqlExecutor for SqliteExecutor {
    fn execute_files(&self, files: &[PathBuf]) -> anyhow::Result<ScriptRunResult> {
        let conn = self.pool.get().context("failed to get a database connection")?;
        let mut result = ScriptRunResult::default();

        for file in files {
            let script = fs::read_to_string(file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            result.touched_files.push(file.clone());

            let statements = split_statements(&script);
            debug!(file = %file.display(), statements = statements.len(), "executing script");
            for statement in statements {
                result.statement_count += 1;
                if let Err((message, assertion)) = Self::run_statement(&conn, &statement) {
                    warn!(file = %file.display(), %message, "statement failed");
                    result.failures.push(StatementFailure {
                        file: file.clone(),
                        statement: statement.sql,
                        message,
                        assertion,
                    });
                    return Ok(result);
                }
            }
        }

        Ok(result)
    }
}

fn directive_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^\s*--\s*@assert-(empty|exists)\b").expect("directive pattern is valid")
    })
}

fn parse_directive(raw: &str) -> Option<AssertDirective> {
    let captures = directive_pattern().captures(raw)?;
    match captures.get(1)?.as_str() {
        "empty" => Some(AssertDirective::Empty),
        "exists" => Some(AssertDirective::Exists),
        _ => None,
    }
}

/// Splits a script on top-level `;`.
///
/// Quoted text, comments and trigger bodies do not split. Chunks holding only
/// comments are dropped; a directive comment travels with the statement that
/// follows it.
pub fn split_statements(script: &str) -> Vec<SqlStatement> {
    let mut statements = Vec::new();
    // `raw` keeps the statement text; `code` blanks literals and comments so
    // keywords can be counted safely.
    let mut raw = String::new();
    let mut code = String::new();
    let mut chars = script.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' | '"' | '`' | '[' => {
                let close = if ch == '[' { ']' } else { ch };
                raw.push(ch);
                code.push(' ');
                while let Some(inner) = chars.next() {
                    raw.push(inner);
                    if inner == close {
                        if close != ']' && chars.next_if_eq(&close).is_some() {
                            raw.push(close);
                            continue;
                        }
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                raw.push(ch);
                for inner in chars.by_ref() {
                    raw.push(inner);
                    if inner == '\n' {
                        break;
                    }
                }
                code.push(' ');
            }
            '/' if chars.peek() == Some(&'*') => {
                raw.push(ch);
                let mut previous = '\0';
                for inner in chars.by_ref() {
                    raw.push(inner);
                    if previous == '*' && inner == '/' {
                        break;
                    }
                    previous = inner;
                }
                code.push(' ');
            }
            ';' if inside_trigger_body(&code) => {
                raw.push(ch);
                code.push(ch);
            }
            ';' => flush_statement(&mut statements, &mut raw, &mut code),
            _ => {
                raw.push(ch);
                code.push(ch);
            }
        }
    }
    flush_statement(&mut statements, &mut raw, &mut code);
    statements
}

fn flush_statement(statements: &mut Vec<SqlStatement>, raw: &mut String, code: &mut String) {
    if !code.trim().is_empty() {
        statements.push(SqlStatement {
            sql: raw.trim().to_string(),
            directive: parse_directive(raw),
        });
    }
    raw.clear();
    code.clear();
}

fn inside_trigger_body(code: &str) -> bool {
    let words: Vec<String> = code
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty())
        .map(str::to_ascii_uppercase)
        .collect();

    let is_trigger = words.first().map(String::as_str) == Some("CREATE")
        && words.iter().take(3).any(|word| word == "TRIGGER");
    if !is_trigger {
        return false;
    }

    let opens = words
        .iter()
        .filter(|word| *word == "BEGIN" || *word == "CASE")
        .count();
    let closes = words.iter().filter(|word| *word == "END").count();
    opens > closes
}

/// `*.sql` files directly under `dir` whose name passes `matches`, sorted by name.
pub fn list_sql_files<F>(dir: &Path, matches: F) -> std::io::Result<Vec<PathBuf>>
where
    F: Fn(&Path) -> bool,
{
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && matches(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
