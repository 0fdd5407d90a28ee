//! Progress tracking for migration operations.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Callback type for progress updates.
pub type ProgressCallback = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Progress update information.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Current phase.
    pub phase: MigrationPhase,

    /// Current item being processed.
    pub current_item: Option<String>,

    /// Items completed in current phase.
    pub completed: u64,

    /// Total items in current phase.
    pub total: u64,

    /// Optional message.
    pub message: Option<String>,
}

/// Phases of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    /// Starting up.
    Initializing,
    /// Scraping the legacy tracker.
    Extracting,
    /// Paging through remote issues.
    FetchingIssues,
    /// Creating issues and comments.
    PostingIssues,
    /// Rewriting attachment links.
    FixingLinks,
    /// Stripping tabs.
    FixingFormatting,
    /// Closing issues.
    ClosingIssues,
    /// Run complete.
    Complete,
}

impl MigrationPhase {
    const ALL: [MigrationPhase; 8] = [
        Self::Initializing,
        Self::Extracting,
        Self::FetchingIssues,
        Self::PostingIssues,
        Self::FixingLinks,
        Self::FixingFormatting,
        Self::ClosingIssues,
        Self::Complete,
    ];

    fn from_u8(value: u8) -> Self {
        Self::ALL
            .get(value as usize)
            .copied()
            .unwrap_or(Self::Complete)
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::Extracting => write!(f, "Processing bugs"),
            Self::FetchingIssues => write!(f, "Fetching GitHub issues"),
            Self::PostingIssues => write!(f, "Posting bugs"),
            Self::FixingLinks => write!(f, "Fixing links"),
            Self::FixingFormatting => write!(f, "Fixing formatting"),
            Self::ClosingIssues => write!(f, "Closing issues"),
            Self::Complete => write!(f, "Complete"),
        }
    }
}

/// Estimate paging progress from issue numbers.
///
/// Issues are listed newest first, so numbers fall from `first` towards 1.
pub fn pagination_percentage(first: u64, current: u64) -> f64 {
    if first == 0 {
        return 0.0;
    }
    100.0 * first.saturating_sub(current) as f64 / first as f64
}

/// Progress tracker for migration operations.
pub struct MigrationProgress {
    phase: AtomicU8,
    completed: AtomicU64,
    total: AtomicU64,
    callback: Option<Arc<ProgressCallback>>,
}

impl MigrationProgress {
    /// Create a new progress tracker.
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(0),
            completed: AtomicU64::new(0),
            total: AtomicU64::new(0),
            callback: None,
        }
    }

    /// Create a progress tracker with a callback.
    pub fn with_callback(callback: ProgressCallback) -> Self {
        Self {
            callback: Some(Arc::new(callback)),
            ..Self::new()
        }
    }

    /// Set the current phase.
    pub fn set_phase(&self, phase: MigrationPhase, total: u64) {
        self.phase.store(phase as u8, Ordering::SeqCst);
        self.completed.store(0, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
        self.notify(None, None);
    }

    /// Increment progress.
    pub fn increment(&self, item: Option<&str>) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.notify(item.map(|s| s.to_string()), None);
    }

    /// Jump to an absolute position.
    pub fn set_completed(&self, completed: u64, item: Option<&str>) {
        self.completed.store(completed, Ordering::SeqCst);
        self.notify(item.map(|s| s.to_string()), None);
    }

    /// Set a message.
    pub fn message(&self, msg: &str) {
        self.notify(None, Some(msg.to_string()));
    }

    /// Get current progress percentage.
    pub fn percentage(&self) -> f64 {
        let total = self.total.load(Ordering::SeqCst);
        if total == 0 {
            return 0.0;
        }
        let completed = self.completed.load(Ordering::SeqCst);
        (completed as f64 / total as f64) * 100.0
    }

    /// Get current phase.
    pub fn current_phase(&self) -> MigrationPhase {
        MigrationPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn notify(&self, current_item: Option<String>, message: Option<String>) {
        if let Some(callback) = &self.callback {
            let update = ProgressUpdate {
                phase: self.current_phase(),
                current_item,
                completed: self.completed.load(Ordering::SeqCst),
                total: self.total.load(Ordering::SeqCst),
                message,
            };
            callback(update);
        }
    }
}

impl Default for MigrationProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Console progress reporter using indicatif.
pub struct ConsoleProgressReporter {
    progress_bar: indicatif::ProgressBar,
}

impl ConsoleProgressReporter {
    /// Create a new console progress reporter.
    pub fn new() -> Self {
        let progress_bar = indicatif::ProgressBar::new(100);

        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
        {
            progress_bar.set_style(style.progress_chars("#>-"));
        }

        Self { progress_bar }
    }

    /// A reporter that draws nothing, for quiet runs.
    pub fn hidden() -> Self {
        Self {
            progress_bar: indicatif::ProgressBar::hidden(),
        }
    }

    /// Create a progress callback for use with migration.
    pub fn callback(&self) -> ProgressCallback {
        let pb = self.progress_bar.clone();
        Box::new(move |update: ProgressUpdate| {
            pb.set_length(update.total);
            pb.set_position(update.completed);

            let mut msg = update.phase.to_string();
            if let Some(item) = &update.current_item {
                msg = format!("{msg}: {item}");
            }
            if let Some(message) = &update.message {
                msg = format!("{msg} - {message}");
            }
            pb.set_message(msg);
        })
    }

    /// Finish the progress bar.
    pub fn finish(&self, message: &str) {
        self.progress_bar.finish_with_message(message.to_string());
    }
}

impl Default for ConsoleProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}
