//! Aggregate progress for a download batch.
//!
//! The tracker counts settled downloads (successful or not) against a total
//! fixed at construction and mirrors the count on an `indicatif` bar.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::{debug, warn};

/// Snapshot of the tracker's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressState {
    pub total: usize,
    pub completed: usize,
    pub last_label: Option<String>,
}

pub struct ProgressTracker {
    state: Mutex<ProgressState>,
    /// Completions recorded after the count already reached `total`.
    excess: Mutex<usize>,
    closed: AtomicBool,
    pb: ProgressBar,
}

impl ProgressTracker {
    /// Tracker with a visible progress bar on stderr.
    pub fn new(total: usize) -> Self {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("Downloading Files {bar:40} {pos}/{len} files [{elapsed_precise}<{eta_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        Self::with_bar(total, pb)
    }

    /// Tracker that counts but never draws.
    pub fn hidden(total: usize) -> Self {
        let pb = ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::hidden());
        Self::with_bar(total, pb)
    }

    fn with_bar(total: usize, pb: ProgressBar) -> Self {
        Self {
            state: Mutex::new(ProgressState {
                total,
                completed: 0,
                last_label: None,
            }),
            excess: Mutex::new(0),
            closed: AtomicBool::new(false),
            pb,
        }
    }

    pub fn total(&self) -> usize {
        self.lock_state().total
    }

    pub fn completed(&self) -> usize {
        self.lock_state().completed
    }

    /// Number of completions that arrived after the count reached `total`.
    pub fn excess(&self) -> usize {
        *self.excess.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ProgressState {
        self.lock_state().clone()
    }

    /// Records one settled download. `label` is the saved file name, `None`
    /// for a failure.
    ///
    /// Calls beyond `total` leave the count at `total` and are tallied in
    /// [`excess`](Self::excess) instead.
    pub fn record_completion(&self, label: Option<&str>) {
        let mut state = self.lock_state();

        if state.completed >= state.total {
            let mut excess = self.excess.lock().unwrap_or_else(PoisonError::into_inner);
            *excess += 1;
            self.pb.suspend(|| {
                warn!(
                    total = state.total,
                    excess = *excess,
                    label = label.unwrap_or("-"),
                    "completion recorded beyond batch total"
                )
            });
            return;
        }

        state.completed += 1;
        if let Some(label) = label {
            state.last_label = Some(label.to_string());
            self.pb.set_message(format!("Last: {label}"));
        }
        self.pb.inc(1);
    }

    /// Human-readable status, e.g. `2/3 files (last: a.gz)`.
    pub fn status(&self) -> String {
        let state = self.lock_state();
        match &state.last_label {
            Some(label) => format!("{}/{} files (last: {label})", state.completed, state.total),
            None => format!("{}/{} files", state.completed, state.total),
        }
    }

    /// Runs `f` with the bar cleared, so lines printed inside it are not
    /// overdrawn.
    pub fn suspend<F: FnOnce() -> R, R>(&self, f: F) -> R {
        self.pb.suspend(f)
    }

    /// Finalizes the display. Only the first call has any effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("progress tracker already closed");
            return;
        }
        self.pb.finish();
        debug!(status = %self.status(), "progress tracker closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
