// src/progress.rs

//! Terminal progress for a build pass
//!
//! One overall bar counts finished packages. Each package being built gets
//! a spinner line underneath that is replaced by a summary line when the
//! package finishes.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// Progress display shared by the scheduler's coordinator
pub struct BuildProgress {
    multi: MultiProgress,
    overall: ProgressBar,
    total: usize,
}

impl BuildProgress {
    /// Progress drawn to stderr for `total` packages
    pub fn new(total: usize) -> Self {
        Self::with_target(total, ProgressDrawTarget::stderr())
    }

    /// Progress that draws nothing
    pub fn hidden(total: usize) -> Self {
        Self::with_target(total, ProgressDrawTarget::hidden())
    }

    fn with_target(total: usize, target: ProgressDrawTarget) -> Self {
        let multi = MultiProgress::with_draw_target(target);
        let overall = multi.add(ProgressBar::new(total as u64));
        overall.set_style(
            ProgressStyle::default_bar()
                .template("{msg} ({pos}/{len}) [{bar:40.green/dim}] {percent}%")
                .expect("Invalid progress bar template")
                .progress_chars("##-"),
        );
        overall.set_message("Building packages...");

        Self {
            multi,
            overall,
            total,
        }
    }

    /// Add a spinner for a package that just started
    ///
    /// `index` is the 1-based start position within the pass and `worker`
    /// the number of the slot running it.
    pub fn start_package(&self, name: &str, index: usize, worker: usize) -> ProgressBar {
        let pb = self.multi.insert_before(&self.overall, ProgressBar::new_spinner());
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("  {spinner:.cyan} {msg} [{elapsed}]")
                .expect("Invalid spinner template"),
        );
        pb.set_message(format!(
            "[{}/{}] (thread {}) building {}",
            index, self.total, worker, name
        ));
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Replace a package's spinner with its outcome
    pub fn finish_package(&self, pb: &ProgressBar, name: &str, success: bool, elapsed: Duration) {
        let status = if success { "Succeeded" } else { "Failed" };
        pb.finish_and_clear();
        self.multi.remove(pb);
        let line = format!(
            "{} building package {} in {:.1} seconds.",
            status,
            name,
            elapsed.as_secs_f64()
        );
        // println only fails when the draw target is hidden
        let _ = self.multi.println(line);
        if success {
            self.overall.inc(1);
        }
    }

    pub fn finish(&self, message: &str) {
        self.overall.finish_with_message(message.to_string());
    }

    pub fn abandon(&self, message: &str) {
        self.overall.abandon_with_message(message.to_string());
    }

    pub fn position(&self) -> u64 {
        self.overall.position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_progress_counts_successes() {
        let progress = BuildProgress::hidden(3);

        let a = progress.start_package("a", 1, 1);
        progress.finish_package(&a, "a", true, Duration::from_millis(1500));
        let b = progress.start_package("b", 2, 2);
        progress.finish_package(&b, "b", false, Duration::from_secs(2));

        assert_eq!(progress.position(), 1);
        progress.finish("done");
    }
}
