//! Status display sink for indexing runs.
//!
//! The coordinator forwards session events here in emission order. The CLI
//! renders them with a progress bar; [`NoopDisplay`] discards them.

use crate::session::{IndexProgress, IndexStats};

pub trait StatusDisplay: Send + Sync {
    /// A run for `project_name` has started.
    fn show(&self, project_name: &str);

    fn hide(&self);

    fn set_stage(&self, stage: &str);

    fn update(&self, progress: &IndexProgress);

    fn show_success(&self, stats: &IndexStats);

    fn show_error(&self, error: &str);

    fn show_cancelled(&self);

    /// Whether the display is currently showing a run.
    fn is_active(&self) -> bool;
}

/// Display that renders nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDisplay;

impl StatusDisplay for NoopDisplay {
    fn show(&self, _project_name: &str) {}

    fn hide(&self) {}

    fn set_stage(&self, _stage: &str) {}

    fn update(&self, _progress: &IndexProgress) {}

    fn show_success(&self, _stats: &IndexStats) {}

    fn show_error(&self, _error: &str) {}

    fn show_cancelled(&self) {}

    fn is_active(&self) -> bool {
        false
    }
}
