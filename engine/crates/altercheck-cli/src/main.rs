use std::path::PathBuf;

use altercheck::history::AlterHistory;
use altercheck::status::PipelineStatus;
use altercheck::{
    runtime, AlterCheck, MigrationConfig, MigrationEnv, RunOutcome, SavePrevious,
    ScriptReplayer, SqliteExecutor, SqliteInspector,
};
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use colored::Colorize;

/// Verifies alter scripts against the saved previous schema.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Working root holding playsql/ and migration/.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Config file to use instead of <root>/altercheck.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay next, restore previous, apply the alter and compare.
    CheckAlter,
    /// Save the current playsql/ as the new previous archive.
    SavePrevious,
    /// Show markers, pending scripts and archives.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List released alter archives.
    History {
        /// Release date as yyyyMMdd; latest release when omitted.
        #[arg(long)]
        date: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => MigrationConfig::load_from_path(path)
            .with_context(|| format!("failed to load config: {}", path.display()))?,
        None => MigrationConfig::load_or_default(&cli.root)
            .with_context(|| format!("failed to load config under {}", cli.root.display()))?,
    };
    runtime::initialize(&config.log_filter)?;
    let env = MigrationEnv::new(cli.root.clone(), config);
    tracing::debug!(root = %env.root().display(), "working root");

    match cli.command {
        Command::CheckAlter => {
            let pool = env.open_pool()?;
            let replayer = ScriptReplayer::new(pool.clone(), env.config());
            let executor = SqliteExecutor::new(pool.clone());
            let inspector = SqliteInspector::new(pool);
            let outcome = AlterCheck::new(&env, &replayer, &executor, &inspector).check_alter();
            report(outcome)
        }
        Command::SavePrevious => {
            let pool = env.open_pool()?;
            let replayer = ScriptReplayer::new(pool, env.config());
            let outcome = SavePrevious::new(&env, &replayer).save_previous();
            report(outcome)
        }
        Command::Status { json } => {
            let status = PipelineStatus::load(&env)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }
            print_status(&status);
            Ok(())
        }
        Command::History { date } => {
            let history = AlterHistory::new(&env);
            let archives = match date {
                Some(date) => {
                    let date = NaiveDate::parse_from_str(&date, "%Y%m%d")
                        .with_context(|| format!("invalid date {date}, expected yyyyMMdd"))?;
                    history.released_on(date)?
                }
                None => history.latest_released()?.into_iter().collect(),
            };
            if archives.is_empty() {
                println!("{}", "no released alter found".yellow());
            }
            for archive in archives {
                println!("{}", archive.display());
            }
            Ok(())
        }
    }
}

fn report(outcome: RunOutcome) -> Result<()> {
    let rendered = outcome.render();
    let (header, body) = rendered.split_once('\n').unwrap_or((rendered.as_str(), ""));
    if outcome.is_success() {
        println!("{}", header.green().bold());
    } else {
        println!("{}", header.red().bold());
    }
    print!("{body}");

    if !outcome.is_success() {
        bail!("{} failed", outcome.task);
    }
    Ok(())
}

fn print_status(status: &PipelineStatus) {
    println!("{}", "markers:".bold());
    if status.markers.is_empty() {
        println!("  (none)");
    }
    for marker in &status.markers {
        let label = if marker.kind.contains("NG") {
            marker.kind.red()
        } else {
            marker.kind.green()
        };
        println!("  {label} {}", marker.file.display());
    }

    println!("{}", "pending alter:".bold());
    for file in &status.pending_alter {
        println!("  {}", file.display());
    }
    println!("{}", "unreleased checked alter:".bold());
    for archive in &status.unreleased {
        println!("  {}", archive.display());
    }
    match &status.latest_previous {
        Some(archive) => println!("{} {}", "latest previous:".bold(), archive.display()),
        None => println!("{} (none)", "latest previous:".bold()),
    }
    println!("{} {}", "next step:".bold(), status.next_step());
}
