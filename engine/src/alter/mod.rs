// In engine/src/alter/mod.rs
mod locator;
mod stage;

pub use locator::{blank_alter_files, pending_alter_files, AlterLocator, AlterScriptBundle, BundleOrigin};
pub use stage::{AlterStage, AlterStageReport, ExecutedFile};
