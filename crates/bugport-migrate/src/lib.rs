//! # Bugport Migration
//!
//! This crate moves bugs from a legacy BugTracker.NET site to a GitHub issue
//! tracker and maintains the migrated issues afterwards.
//!
//! ## Features
//!
//! - **Extraction**: Scrapes the bug list and every bug thread, including attachments
//! - **Transfer**: Creates one issue per bug with its comments, resumable by bug id
//! - **Attachments**: Re-hosts files over FTP or into a local web root
//! - **Maintenance**: Link repair, tab stripping and closing issues of closed bugs
//! - **Throttling**: Backs off on abuse detection and waits out the rate limit
//!
//! ## Example
//!
//! ```rust,ignore
//! use bugport_migrate::{MigrationConfig, MigrationOptions, Migrator, RehostLayout};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = MigrationConfig::new("https://www.apsim.info/BugTracker/", "owner/repo")
//!         .with_token("ghp_xxx");
//!
//!     let options = MigrationOptions::default().with_max_bugs(10);
//!
//!     let migrator = Migrator::new(config, options, RehostLayout::new("https://www.apsim.info"))?;
//!     let report = migrator.run().await?;
//!
//!     report.print_summary();
//!     Ok(())
//! }
//! ```

pub mod credentials;
pub mod error;
pub mod extract;
pub mod github;
pub mod migrator;
pub mod progress;
pub mod sink;
pub mod throttle;
pub mod tracker;
pub mod transfer;
pub mod types;

// Re-export main types
pub use credentials::{read_ftp_credentials, read_token, FtpCredentials};
pub use error::{ErrorClass, MigrationError, Result};
pub use extract::{ExtractionRules, Extractor};
pub use github::GitHubClient;
pub use migrator::Migrator;
pub use progress::{ConsoleProgressReporter, MigrationProgress, ProgressCallback};
pub use sink::{legacy_id, AttachmentHandling, IssueSink};
pub use throttle::{Throttle, ThrottleConfig};
pub use tracker::IssueTracker;
pub use transfer::{AttachmentStore, AttachmentTransfer, DirectoryStore, FtpConfig, FtpStore, RehostLayout};
pub use types::*;

pub use bugport_types::{Attachment, Bug, Comment};

/// Version of the migration tools.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_options_builder() {
        let options = MigrationOptions::default()
            .with_mode(MigrationMode::CloseIssues)
            .with_max_bugs(0)
            .with_reupload(true)
            .with_resume_after(3000);

        assert_eq!(options.mode, MigrationMode::CloseIssues);
        assert_eq!(options.max_bugs, None);
        assert!(options.reupload);
        assert!(options.already_migrated(3000));
        assert!(!options.already_migrated(3001));
        assert_eq!(options.attachment_failure, AttachmentFailurePolicy::Abort);
    }

    #[test]
    fn test_migration_report_summary() {
        let mut report = MigrationReport::new(MigrationMode::Transfer);
        report.issues_created = 10;
        report.comments_posted = 5;

        assert!(report.is_successful());
        assert_eq!(report.total_writes(), 15);
    }
}
