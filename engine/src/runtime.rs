// In engine/src/runtime.rs
use std::sync::OnceLock;

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Installs the global tracing subscriber once per process.
///
/// `RUST_LOG` wins over `default_filter` when set.
pub fn initialize(default_filter: &str) -> Result<()> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)?,
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init()?;

    INITIALIZED.get_or_init(|| ());
    Ok(())
}
