//! Configuration and report types for migration operations.

use crate::error::{MigrationError, Result};
use crate::throttle::ThrottleConfig;
use chrono::{DateTime, Utc};
use console::style;
use serde::{Deserialize, Serialize};

/// Default root of the legacy tracker.
pub const DEFAULT_SOURCE_URL: &str = "https://www.apsim.info/BugTracker/";

/// Default GitHub REST endpoint.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Where to read from and where to write to.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Root URL of the legacy tracker, always ending in `/`.
    pub source_url: String,

    /// Target repository (`owner/repo`).
    pub target_repo: String,

    /// Issue tracker API base URL.
    pub api_url: String,

    /// API token.
    pub token: Option<String>,
}

impl MigrationConfig {
    /// Create a new migration configuration.
    pub fn new(source_url: impl Into<String>, target_repo: impl Into<String>) -> Self {
        Self {
            source_url: normalize_root(source_url.into()),
            target_repo: target_repo.into(),
            api_url: DEFAULT_API_URL.to_string(),
            token: None,
        }
    }

    /// Set the API token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Point the client at a different API host.
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Split `target_repo` into owner and name.
    pub fn parse_repo(&self) -> Result<(String, String)> {
        match self.target_repo.split('/').collect::<Vec<_>>()[..] {
            [owner, repo] if !owner.is_empty() && !repo.is_empty() => {
                Ok((owner.to_string(), repo.to_string()))
            }
            _ => Err(MigrationError::InvalidConfig(format!(
                "Invalid repository format: {}. Expected 'owner/repo'",
                self.target_repo
            ))),
        }
    }
}

fn normalize_root(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

/// The operation a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationMode {
    /// Extract every bug and post it as a new issue.
    #[default]
    Transfer,
    /// Add a scheme to attachment links that lack one.
    FixLinks,
    /// Point links at the legacy tracker to re-hosted attachments.
    FixLinksV2,
    /// Strip tab characters from issue and comment bodies.
    FixFormatting,
    /// Close issues whose legacy bug is closed.
    CloseIssues,
}

impl std::fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transfer => write!(f, "transfer"),
            Self::FixLinks => write!(f, "fix-links"),
            Self::FixLinksV2 => write!(f, "fix-links-v2"),
            Self::FixFormatting => write!(f, "fix-formatting"),
            Self::CloseIssues => write!(f, "close-issues"),
        }
    }
}

/// What to do with a bug whose attachments cannot be re-hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachmentFailurePolicy {
    /// Stop the run.
    #[default]
    Abort,
    /// Record the error and continue with the next bug.
    Skip,
}

/// Options for controlling a run.
#[derive(Debug, Clone, Default)]
pub struct MigrationOptions {
    /// Operation to perform.
    pub mode: MigrationMode,

    /// Maximum number of bugs (or issues) to process. `None` is unlimited.
    pub max_bugs: Option<usize>,

    /// Download attachments and upload them to the file store.
    pub reupload: bool,

    /// Bugs with an id at or below this were migrated by an earlier run.
    pub resume_after: Option<i64>,

    /// Reaction to attachment transfer failures.
    pub attachment_failure: AttachmentFailurePolicy,

    /// Pauses between remote writes.
    pub throttle: ThrottleConfig,
}

impl MigrationOptions {
    /// Select the operation.
    pub fn with_mode(mut self, mode: MigrationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Cap the number of bugs. Zero or negative means unlimited.
    pub fn with_max_bugs(mut self, cap: i64) -> Self {
        self.max_bugs = usize::try_from(cap).ok().filter(|&n| n > 0);
        self
    }

    /// Enable or disable attachment re-upload.
    pub fn with_reupload(mut self, reupload: bool) -> Self {
        self.reupload = reupload;
        self
    }

    /// Skip bugs with an id at or below `id`.
    pub fn with_resume_after(mut self, id: i64) -> Self {
        self.resume_after = Some(id);
        self
    }

    /// Set the attachment failure policy.
    pub fn with_attachment_failure(mut self, policy: AttachmentFailurePolicy) -> Self {
        self.attachment_failure = policy;
        self
    }

    /// Replace the throttle settings.
    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    /// Returns true if the bug was migrated by an earlier run.
    pub fn already_migrated(&self, bug_id: i64) -> bool {
        self.resume_after.is_some_and(|threshold| bug_id <= threshold)
    }
}

/// Report of a completed run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Operation that was performed.
    pub mode: MigrationMode,

    /// Bugs read from the legacy tracker.
    pub bugs_extracted: usize,

    /// Bugs skipped by the resume threshold or a failure policy.
    pub bugs_skipped: usize,

    /// Issues created.
    pub issues_created: usize,

    /// Comments created.
    pub comments_posted: usize,

    /// Attachments downloaded and uploaded again.
    pub attachments_rehosted: usize,

    /// Remote issues examined by a maintenance pass.
    pub issues_examined: usize,

    /// Issue bodies rewritten.
    pub issues_updated: usize,

    /// Comment bodies rewritten.
    pub comments_updated: usize,

    /// Issues closed.
    pub issues_closed: usize,

    /// Errors encountered during the run.
    pub errors: Vec<MigrationErrorInfo>,

    /// Warnings generated during the run.
    pub warnings: Vec<String>,

    /// Start time.
    pub started_at: Option<DateTime<Utc>>,

    /// End time.
    pub completed_at: Option<DateTime<Utc>>,
}

impl MigrationReport {
    /// Create a new empty report.
    pub fn new(mode: MigrationMode) -> Self {
        Self {
            mode,
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Mark the run as complete.
    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    /// Check if the run finished without critical errors.
    pub fn is_successful(&self) -> bool {
        self.errors.iter().all(|e| !e.is_critical)
    }

    /// Total number of remote writes.
    pub fn total_writes(&self) -> usize {
        self.issues_created
            + self.comments_posted
            + self.issues_updated
            + self.comments_updated
            + self.issues_closed
    }

    /// Add an error to the report.
    pub fn add_error(&mut self, category: &str, message: &str, is_critical: bool) {
        self.errors.push(MigrationErrorInfo {
            category: category.to_string(),
            message: message.to_string(),
            is_critical,
        });
    }

    /// Add a warning to the report.
    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Get the duration of the run.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Print a summary of the run.
    pub fn print_summary(&self) {
        println!("\n=== Migration Summary ({}) ===\n", self.mode);
        println!("Bugs extracted:       {}", self.bugs_extracted);
        println!("Bugs skipped:         {}", self.bugs_skipped);
        println!("Issues created:       {}", self.issues_created);
        println!("Comments posted:      {}", self.comments_posted);
        println!("Attachments rehosted: {}", self.attachments_rehosted);
        if self.issues_examined > 0 {
            println!("Issues examined:      {}", self.issues_examined);
        }
        println!("Issues updated:       {}", self.issues_updated);
        println!("Comments updated:     {}", self.comments_updated);
        println!("Issues closed:        {}", self.issues_closed);

        if let Some(duration) = self.duration() {
            println!("\nCompleted in {} seconds", duration.num_seconds());
        }

        if !self.errors.is_empty() {
            println!("\nErrors ({}):", self.errors.len());
            for error in &self.errors {
                let severity = if error.is_critical {
                    style("CRITICAL").red()
                } else {
                    style("WARNING").yellow()
                };
                println!("  [{severity}] {}: {}", error.category, error.message);
            }
        }

        if !self.warnings.is_empty() {
            println!("\nWarnings ({}):", self.warnings.len());
            for warning in &self.warnings {
                println!("  - {warning}");
            }
        }

        let status = if self.is_successful() {
            style("SUCCESS").green()
        } else {
            style("FAILED").red()
        };
        println!("\nOverall Status: {status}");
    }
}

/// Information about an error that occurred during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationErrorInfo {
    /// Category of the error (e.g., "attachments", "issues").
    pub category: String,

    /// Error message.
    pub message: String,

    /// Whether this error is critical.
    pub is_critical: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_url_gets_trailing_slash() {
        let config = MigrationConfig::new("https://example.org/BugTracker", "o/r");
        assert_eq!(config.source_url, "https://example.org/BugTracker/");
    }

    #[test]
    fn test_parse_repo() {
        let config = MigrationConfig::new(DEFAULT_SOURCE_URL, "APSIMInitiative/APSIMClassic");
        let (owner, repo) = config.parse_repo().unwrap();
        assert_eq!(owner, "APSIMInitiative");
        assert_eq!(repo, "APSIMClassic");

        let bad = MigrationConfig::new(DEFAULT_SOURCE_URL, "no-slash");
        assert!(matches!(bad.parse_repo(), Err(MigrationError::InvalidConfig(_))));
    }

    #[test]
    fn test_max_bugs_cap() {
        assert_eq!(MigrationOptions::default().with_max_bugs(0).max_bugs, None);
        assert_eq!(MigrationOptions::default().with_max_bugs(-1).max_bugs, None);
        assert_eq!(MigrationOptions::default().with_max_bugs(25).max_bugs, Some(25));
    }

    #[test]
    fn test_resume_threshold() {
        let options = MigrationOptions::default().with_resume_after(50);
        assert!(options.already_migrated(1));
        assert!(options.already_migrated(50));
        assert!(!options.already_migrated(51));
        assert!(!MigrationOptions::default().already_migrated(1));
    }

    #[test]
    fn test_report_totals() {
        let mut report = MigrationReport::new(MigrationMode::Transfer);
        report.issues_created = 2;
        report.comments_posted = 3;
        report.issues_closed = 1;
        assert_eq!(report.total_writes(), 6);
        assert!(report.is_successful());

        report.add_error("attachments", "download failed", true);
        assert!(!report.is_successful());
    }
}
