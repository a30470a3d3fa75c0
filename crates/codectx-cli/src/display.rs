//! Terminal status display for indexing runs.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use codectx_index::{IndexProgress, IndexStats, StatusDisplay};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Renders coordinator events as a spinner that turns into a progress bar
/// once the embedding total is known.
pub struct ProgressDisplay {
    bar: Mutex<Option<ProgressBar>>,
    hidden: bool,
}

impl Default for ProgressDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressDisplay {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
            hidden: false,
        }
    }

    /// A display that tracks state but draws nothing.
    pub fn hidden() -> Self {
        Self {
            bar: Mutex::new(None),
            hidden: true,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ProgressBar>> {
        self.bar.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spinner(&self) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        if self.hidden {
            spinner.set_draw_target(ProgressDrawTarget::hidden());
        }
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {prefix:.bold} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} chunks {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##.")
    }

    /// Finish the current bar with `message`, leaving it on screen.
    fn finish(&self, message: String) {
        if let Some(bar) = self.lock().take() {
            bar.finish_with_message(message);
        }
    }
}

impl StatusDisplay for ProgressDisplay {
    fn show(&self, project_name: &str) {
        let spinner = self.spinner();
        spinner.set_prefix(project_name.to_string());
        spinner.set_message("starting");
        if let Some(previous) = self.lock().replace(spinner) {
            previous.finish_and_clear();
        }
    }

    fn hide(&self) {
        if let Some(bar) = self.lock().take() {
            bar.finish_and_clear();
        }
    }

    fn set_stage(&self, stage: &str) {
        if let Some(bar) = self.lock().as_ref() {
            bar.set_message(stage.to_string());
        }
    }

    fn update(&self, progress: &IndexProgress) {
        let guard = self.lock();
        let Some(bar) = guard.as_ref() else {
            return;
        };
        if bar.length() != Some(progress.total as u64) {
            bar.set_style(Self::bar_style());
            bar.set_length(progress.total as u64);
        }
        bar.set_position(progress.completed as u64);
    }

    fn show_success(&self, stats: &IndexStats) {
        let mut message = format!(
            "indexed {} chunks from {} files in {:.1}s",
            stats.chunks_embedded,
            stats.files_processed,
            stats.duration_ms as f64 / 1000.0
        );
        if stats.fallback_batches > 0 {
            message.push_str(&format!(" ({} batches via fallback)", stats.fallback_batches));
        }
        self.finish(message);
    }

    fn show_error(&self, error: &str) {
        if let Some(bar) = self.lock().take() {
            bar.abandon_with_message(format!("failed: {error}"));
        }
    }

    fn show_cancelled(&self) {
        if let Some(bar) = self.lock().take() {
            bar.abandon_with_message("cancelled");
        }
    }

    fn is_active(&self) -> bool {
        self.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_success() {
        let display = ProgressDisplay::hidden();
        assert!(!display.is_active());

        display.show("demo");
        assert!(display.is_active());
        display.set_stage("embedding");
        display.update(&IndexProgress {
            stage: "embedding".to_string(),
            completed: 3,
            total: 10,
        });
        assert_eq!(display.lock().as_ref().unwrap().length(), Some(10));
        assert_eq!(display.lock().as_ref().unwrap().position(), 3);

        display.show_success(&IndexStats::default());
        assert!(!display.is_active());
    }

    #[test]
    fn test_cancel_and_hide_deactivate() {
        let display = ProgressDisplay::hidden();
        display.show("demo");
        display.show_cancelled();
        assert!(!display.is_active());

        display.show("demo");
        display.hide();
        assert!(!display.is_active());

        // Events after the run ended are ignored.
        display.show_error("late");
        assert!(!display.is_active());
    }
}
