// In engine/src/alter/stage.rs
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use super::{AlterLocator, AlterScriptBundle};
use crate::config::MigrationEnv;
use crate::executor::{ScriptRunResult, SqlExecutor};
use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutedFile {
    pub path: PathBuf,
    pub passed: bool,
}

/// Trace of a successful alter run plus take-finally assertions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlterStageReport {
    pub alter: ScriptRunResult,
    pub take_finally: ScriptRunResult,
    pub elapsed: Duration,
}

impl AlterStageReport {
    /// Real statements executed by the alter bundle itself.
    pub fn alter_statement_count(&self) -> usize {
        self.alter.statement_count
    }

    pub fn executed_files(&self) -> Vec<PathBuf> {
        self.alter
            .touched_files
            .iter()
            .chain(&self.take_finally.touched_files)
            .cloned()
            .collect()
    }
}

pub struct AlterStage<'a> {
    env: &'a MigrationEnv,
    executor: &'a dyn SqlExecutor,
}

impl<'a> AlterStage<'a> {
    pub fn new(env: &'a MigrationEnv, executor: &'a dyn SqlExecutor) -> Self {
        Self { env, executor }
    }

    /// Runs the bundle, then the take-finally scripts of the alter directory.
    pub fn apply_and_assert(&self, bundle: &AlterScriptBundle) -> Result<AlterStageReport, Error> {
        let started = Instant::now();

        let alter = match self.executor.execute_files(&bundle.files) {
            Ok(result) => result,
            Err(err) => {
                return Err(Error::AlterExecutionFailure {
                    executed: Vec::new(),
                    statement: None,
                    message: format!("{err:#}"),
                    elapsed: started.elapsed(),
                })
            }
        };
        if let Some(failure) = alter.first_failure() {
            warn!(file = %failure.file.display(), "alter statement failed");
            return Err(Error::AlterExecutionFailure {
                executed: trail(&[], &alter.touched_files),
                statement: Some(failure.statement.clone()),
                message: failure.message.clone(),
                elapsed: started.elapsed(),
            });
        }

        let take_finally_files = AlterLocator::new(self.env).list_take_finally_files()?;
        let take_finally = match self.executor.execute_files(&take_finally_files) {
            Ok(result) => result,
            Err(err) => {
                return Err(Error::TakeFinallyAssertionFailure {
                    executed: passed(&alter.touched_files),
                    statement: None,
                    message: format!("{err:#}"),
                    elapsed: started.elapsed(),
                })
            }
        };
        if let Some(failure) = take_finally.first_failure() {
            warn!(file = %failure.file.display(), "take-finally assertion failed");
            return Err(Error::TakeFinallyAssertionFailure {
                executed: trail(&alter.touched_files, &take_finally.touched_files),
                statement: Some(failure.statement.clone()),
                message: failure.message.clone(),
                elapsed: started.elapsed(),
            });
        }

        let report = AlterStageReport {
            alter,
            take_finally,
            elapsed: started.elapsed(),
        };
        info!(
            alter_statements = report.alter.statement_count,
            take_finally_files = report.take_finally.touched_files.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "alter applied"
        );
        Ok(report)
    }
}

fn passed(files: &[PathBuf]) -> Vec<ExecutedFile> {
    files
        .iter()
        .map(|path| ExecutedFile {
            path: path.clone(),
            passed: true,
        })
        .collect()
}

/// `before` all passed; the last of `failing_run` is the one that failed.
fn trail(before: &[PathBuf], failing_run: &[PathBuf]) -> Vec<ExecutedFile> {
    let mut executed = passed(before);
    executed.extend(passed(failing_run));
    if let Some(last) = executed.last_mut() {
        last.passed = false;
    }
    executed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigrationConfig;
    use crate::executor::StatementFailure;
    use std::cell::RefCell;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    /// Fails the first statement of any file whose name contains `fail_on`.
    struct ScriptedExecutor {
        fail_on: Option<&'static str>,
        calls: RefCell<Vec<Vec<PathBuf>>>,
    }

    impl SqlExecutor for ScriptedExecutor {
        fn execute_files(&self, files: &[PathBuf]) -> anyhow::Result<ScriptRunResult> {
            self.calls.borrow_mut().push(files.to_vec());
            let mut result = ScriptRunResult::default();
            for file in files {
                result.touched_files.push(file.clone());
                let name = file.file_name().unwrap().to_string_lossy().into_owned();
                if self.fail_on.map(|needle| name.contains(needle)).unwrap_or(false) {
                    result.failures.push(StatementFailure {
                        file: file.clone(),
                        statement: "select broken".to_string(),
                        message: "boom".to_string(),
                        assertion: true,
                    });
                    return Ok(result);
                }
                result.statement_count += 1;
            }
            Ok(result)
        }
    }

    fn workspace(files: &[&str]) -> (TempDir, MigrationEnv) {
        let temp_dir = TempDir::new().unwrap();
        let env = MigrationEnv::new(temp_dir.path(), MigrationConfig::default());
        fs::create_dir_all(env.alter_dir()).unwrap();
        for name in files {
            fs::write(env.alter_dir().join(name), "select 1;").unwrap();
        }
        (temp_dir, env)
    }

    fn bundle(env: &MigrationEnv) -> AlterScriptBundle {
        AlterLocator::new(env).locate().unwrap()
    }

    fn names(files: &[ExecutedFile]) -> Vec<(String, bool)> {
        files
            .iter()
            .map(|file| {
                (
                    Path::new(&file.path)
                        .file_name()
                        .unwrap()
                        .to_string_lossy()
                        .into_owned(),
                    file.passed,
                )
            })
            .collect()
    }

    #[test]
    fn alter_then_take_finally_in_order() {
        let (_temp_dir, env) = workspace(&["alter-schema-1.sql", "alter-schema-2.sql", "take-finally.sql"]);
        let executor = ScriptedExecutor {
            fail_on: None,
            calls: RefCell::new(Vec::new()),
        };

        let report = AlterStage::new(&env, &executor)
            .apply_and_assert(&bundle(&env))
            .unwrap();
        assert_eq!(report.alter_statement_count(), 2);
        assert_eq!(report.executed_files().len(), 3);
        assert_eq!(executor.calls.borrow().len(), 2);
    }

    #[test]
    fn alter_failure_is_alf_and_skips_take_finally() {
        let (_temp_dir, env) = workspace(&["alter-schema-1.sql", "alter-schema-2-bad.sql", "take-finally.sql"]);
        let executor = ScriptedExecutor {
            fail_on: Some("bad"),
            calls: RefCell::new(Vec::new()),
        };

        let err = AlterStage::new(&env, &executor)
            .apply_and_assert(&bundle(&env))
            .unwrap_err();
        assert_eq!(err.alter_ng_code(), Some(crate::marker::AlterNgCode::Alf));
        assert_eq!(
            err.failed_file().map(|file| file.path.clone()),
            Some(env.alter_dir().join("alter-schema-2-bad.sql"))
        );
        assert_eq!(executor.calls.borrow().len(), 1);
    }

    #[test]
    fn take_finally_failure_reports_full_trail() {
        let (_temp_dir, env) = workspace(&[
            "alter-schema.sql",
            "take-finally-1.sql",
            "take-finally-2-bad.sql",
        ]);
        let executor = ScriptedExecutor {
            fail_on: Some("bad"),
            calls: RefCell::new(Vec::new()),
        };

        let err = AlterStage::new(&env, &executor)
            .apply_and_assert(&bundle(&env))
            .unwrap_err();
        let Error::TakeFinallyAssertionFailure { executed, message, .. } = &err else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!(message, "boom");
        assert_eq!(
            names(executed),
            vec![
                ("alter-schema.sql".to_string(), true),
                ("take-finally-1.sql".to_string(), true),
                ("take-finally-2-bad.sql".to_string(), false),
            ]
        );
    }
}
