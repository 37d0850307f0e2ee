// In engine/src/orchestrator/mod.rs
//!
//! The two pipeline entry points and the outcome they report.
//!
//! Orchestrators never return `Err`: every failure is folded into a
//! [`RunOutcome`] after the markers describing it have been persisted, so a
//! caller can render the same report whether the run failed or not.

use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::alter::BundleOrigin;
use crate::Error;

mod alter_check;
mod save_previous;

pub use alter_check::AlterCheck;
pub use save_previous::SavePrevious;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Task {
    AlterCheck,
    SavePrevious,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::AlterCheck => f.write_str("AlterCheck"),
            Task::SavePrevious => f.write_str("SavePrevious"),
        }
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub task: Task,
    pub success: bool,
    pub details: Vec<String>,
    pub advice: Vec<String>,
    pub failure: Option<Error>,
    pub elapsed: Duration,
    pub files: Vec<PathBuf>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn render(&self) -> String {
        let status = if self.success { "success" } else { "failure" };
        let mut out = format!(
            "[{}] {status} ({:.3}s)\n",
            self.task,
            self.elapsed.as_secs_f64()
        );
        for line in &self.details {
            out.push_str("  ");
            out.push_str(line);
            out.push('\n');
        }
        if !self.advice.is_empty() {
            out.push_str("advice:\n");
            for line in &self.advice {
                out.push_str("  ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }
}

/// Detail lines and involved files collected while a run progresses.
pub(crate) struct Trail {
    task: Task,
    started: Instant,
    details: Vec<String>,
    files: Vec<PathBuf>,
}

impl Trail {
    pub(crate) fn new(task: Task) -> Self {
        info!(%task, "run started");
        Self {
            task,
            started: Instant::now(),
            details: Vec::new(),
            files: Vec::new(),
        }
    }

    pub(crate) fn note(&mut self, line: impl Into<String>) {
        let line = line.into();
        info!(task = %self.task, "{line}");
        self.details.push(line);
    }

    pub(crate) fn file(&mut self, path: PathBuf) {
        if !self.files.contains(&path) {
            self.files.push(path);
        }
    }

    pub(crate) fn files(&mut self, paths: impl IntoIterator<Item = PathBuf>) {
        for path in paths {
            self.file(path);
        }
    }

    pub(crate) fn succeed(self) -> RunOutcome {
        let elapsed = self.started.elapsed();
        info!(task = %self.task, elapsed_ms = elapsed.as_millis() as u64, "run succeeded");
        RunOutcome {
            task: self.task,
            success: true,
            details: self.details,
            advice: Vec::new(),
            failure: None,
            elapsed,
            files: self.files,
        }
    }

    pub(crate) fn fail(mut self, err: Error) -> RunOutcome {
        let elapsed = self.started.elapsed();
        warn!(task = %self.task, error = %err, "run failed");

        self.details.push(err.to_string());
        let mut source = err.source();
        while let Some(cause) = source {
            self.details.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        if let Some(file) = err.failed_file() {
            self.details
                .push(format!("failed file: {}", file.path.display()));
        }
        match &err {
            Error::AlterExecutionFailure { statement: Some(statement), .. }
            | Error::TakeFinallyAssertionFailure { statement: Some(statement), .. } => {
                self.details.push(format!("statement: {statement}"));
            }
            Error::DifferenceFound {
                report,
                diff_file,
                summary_file,
            } => {
                self.details.extend(report.summary_lines());
                self.files.push(diff_file.clone());
                self.files.push(summary_file.clone());
            }
            Error::SavePreviousInvalidStatus { pending } => {
                for file in pending {
                    self.details.push(format!("pending: {}", file.display()));
                }
            }
            _ => {}
        }

        RunOutcome {
            task: self.task,
            success: false,
            details: self.details,
            advice: advice_for(&err),
            failure: Some(err),
            elapsed,
            files: self.files,
        }
    }
}

/// What the operator should do next for a given failure.
pub fn advice_for(err: &Error) -> Vec<String> {
    let lines: &[&str] = match err {
        Error::NextBuildFailure { .. } => &[
            "The next schema could not be built from playsql/.",
            "Fix the replace-schema, data or take-finally scripts and run check-alter again.",
        ],
        Error::PreviousRestoreFailure { .. } => &[
            "The database could not be rolled back to the previous schema.",
            "Check migration/previous/, or run save-previous from a release that still builds.",
        ],
        Error::AlterSqlNotFound { .. } => &[
            "No alter script exists and an empty one could not be created.",
            "Make migration/alter/ writable and create alter-schema.sql there.",
        ],
        Error::AlterExecutionFailure { .. } => &[
            "An alter statement failed against the previous schema.",
            "Fix the failing statement and run check-alter again.",
        ],
        Error::TakeFinallyAssertionFailure { .. } => &[
            "The alter ran but a take-finally assertion failed afterwards.",
            "Either the alter misses a data change or the assertion is wrong.",
        ],
        Error::DifferenceFound { .. } => &[
            "The altered previous schema still differs from the next schema.",
            "See migration/alter-check-result.txt and add the missing changes to the alter script.",
        ],
        Error::EmptyAlterSuccess {
            origin: BundleOrigin::Placeholder,
            ..
        } => &[
            "Next and previous schemas are identical and no alter script was written yet.",
            "Change the schema in playsql/ first, then write the alter in migration/alter/alter-schema.sql.",
        ],
        Error::EmptyAlterSuccess { .. } => &[
            "The alter scripts executed no statement and nothing differs.",
            "Change the schema first; an empty alter is not a valid migration.",
        ],
        Error::SavePreviousInvalidStatus { .. } => &[
            "Alter scripts are still pending in migration/alter/.",
            "Run check-alter until it succeeds, then save previous again.",
        ],
        Error::CheckpointValidationFailure { .. } => &[
            "The saved previous archive does not replay.",
            "Fix the resources in playsql/ and run save-previous again.",
        ],
        _ => &["Check the log output above, fix the cause and run again."],
    };
    lines.iter().map(|line| line.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_outcome_carries_chain_and_advice() {
        let err = Error::NextBuildFailure {
            resource_dir: PathBuf::from("playsql"),
            source: anyhow::anyhow!("no replace-schema*.sql found").into(),
        };
        let outcome = Trail::new(Task::AlterCheck).fail(err);

        assert!(!outcome.is_success());
        assert!(outcome
            .details
            .iter()
            .any(|line| line == "caused by: no replace-schema*.sql found"));
        assert_eq!(outcome.advice.len(), 2);
        let rendered = outcome.render();
        assert!(rendered.starts_with("[AlterCheck] failure"));
        assert!(rendered.contains("advice:"));
    }

    #[test]
    fn placeholder_empty_alter_gets_specific_advice() {
        let placeholder = advice_for(&Error::EmptyAlterSuccess {
            origin: BundleOrigin::Placeholder,
            files: Vec::new(),
        });
        let authored = advice_for(&Error::EmptyAlterSuccess {
            origin: BundleOrigin::Authored,
            files: Vec::new(),
        });
        assert_ne!(placeholder, authored);
    }
}
