//! Runs one migration mode end to end.

use crate::error::{MigrationError, Result};
use crate::extract::{ExtractionRules, Extractor};
use crate::github::GitHubClient;
use crate::progress::{MigrationPhase, MigrationProgress};
use crate::sink::{AttachmentHandling, AttachmentLinkFix, IssueSink, PassOutcome, SchemeFix};
use crate::throttle::Throttle;
use crate::tracker::IssueTracker;
use crate::transfer::{AttachmentTransfer, RehostLayout};
use crate::types::{AttachmentFailurePolicy, MigrationConfig, MigrationMode, MigrationOptions, MigrationReport};

use bugport_types::Bug;
use tracing::{debug, error, info, trace, warn};

/// Moves bugs from the legacy tracker to an issue tracker.
pub struct Migrator<T = GitHubClient> {
    config: MigrationConfig,
    options: MigrationOptions,
    extractor: Extractor,
    sink: IssueSink<T>,
    layout: RehostLayout,
    progress: MigrationProgress,
}

impl Migrator<GitHubClient> {
    /// Create a migrator writing to the GitHub repository in `config`.
    pub fn new(
        config: MigrationConfig,
        options: MigrationOptions,
        layout: RehostLayout,
    ) -> Result<Self> {
        let (owner, repo) = config.parse_repo()?;
        let client = GitHubClient::new(&config.api_url, owner, repo, config.token.clone())?;
        Self::with_tracker(client, config, options, layout)
    }
}

impl<T: IssueTracker> Migrator<T> {
    /// Create a migrator writing to `tracker`.
    ///
    /// Attachment links are pointed at `layout` without transferring
    /// anything until [`with_transfer`](Self::with_transfer) is called.
    pub fn with_tracker(
        tracker: T,
        config: MigrationConfig,
        options: MigrationOptions,
        layout: RehostLayout,
    ) -> Result<Self> {
        let extractor = Extractor::new(&config.source_url, ExtractionRules::default())?;
        let sink = IssueSink::new(tracker, Throttle::new(options.throttle.clone()))
            .with_attachments(AttachmentHandling::Relocate(layout.clone()));

        Ok(Self {
            config,
            options,
            extractor,
            sink,
            layout,
            progress: MigrationProgress::new(),
        })
    }

    /// Replace the extraction rules.
    pub fn with_extraction_rules(mut self, rules: ExtractionRules) -> Result<Self> {
        self.extractor = Extractor::new(&self.config.source_url, rules)?;
        Ok(self)
    }

    /// Use `transfer` to re-host attachments when re-upload is enabled.
    pub fn with_transfer(mut self, transfer: AttachmentTransfer) -> Self {
        if self.options.reupload {
            self.sink = self.sink.with_attachments(AttachmentHandling::Rehost(transfer));
        } else {
            debug!("Re-upload disabled, attachment store unused");
        }
        self
    }

    /// Set a progress tracker.
    pub fn with_progress(mut self, progress: MigrationProgress) -> Self {
        self.progress = progress;
        self
    }

    /// The sink writing to the tracker.
    pub fn sink(&self) -> &IssueSink<T> {
        &self.sink
    }

    /// Run the configured mode.
    pub async fn run(&self) -> Result<MigrationReport> {
        let mode = self.options.mode;
        let mut report = MigrationReport::new(mode);

        info!(mode = %mode, repo = %self.config.target_repo, "Starting migration");
        self.progress.set_phase(MigrationPhase::Initializing, 1);

        if self.options.reupload && !self.sink.rehosts() {
            return Err(MigrationError::InvalidConfig(
                "re-upload requested but no attachment store configured".to_string(),
            ));
        }

        let max = self.options.max_bugs;
        match mode {
            MigrationMode::Transfer => {
                let bugs = self.extract(max, &mut report).await?;
                self.transfer_bugs(&bugs, &mut report).await?;
            }
            MigrationMode::FixLinks => {
                let host = self.extractor.root().host_str().ok_or_else(|| {
                    MigrationError::InvalidConfig(format!("{} has no host", self.config.source_url))
                })?;
                let fix = SchemeFix::new(host)?;
                let issues = self.sink.list_issues(None, &self.progress).await?;
                let outcome = self.sink.fix_links(&issues, &fix, &self.progress).await?;
                absorb(&mut report, outcome);
            }
            MigrationMode::FixLinksV2 => {
                // Every listed issue must find its bug, so extraction is never capped.
                let bugs = self.extract(None, &mut report).await?;
                let fix = AttachmentLinkFix::new(self.extractor.root().as_str(), self.layout.clone())?;
                let issues = self.sink.list_issues(max, &self.progress).await?;
                let outcome = self
                    .sink
                    .fix_links_v2(&issues, &bugs, &fix, &self.progress)
                    .await?;
                absorb(&mut report, outcome);
            }
            MigrationMode::FixFormatting => {
                let issues = self.sink.list_issues(max, &self.progress).await?;
                let outcome = self.sink.fix_formatting(&issues, &self.progress).await?;
                absorb(&mut report, outcome);
            }
            MigrationMode::CloseIssues => {
                let issues = self.sink.list_issues(max, &self.progress).await?;
                let bugs = self.extract(None, &mut report).await?;
                let outcome = self.sink.close_sync(&issues, &bugs, &self.progress).await?;
                absorb(&mut report, outcome);
            }
        }

        self.progress.set_phase(MigrationPhase::Complete, 1);
        report.complete();
        info!(writes = report.total_writes(), "Migration finished");
        Ok(report)
    }

    async fn extract(&self, cap: Option<usize>, report: &mut MigrationReport) -> Result<Vec<Bug>> {
        let bugs = self.extractor.extract(cap, &self.progress).await?;
        report.bugs_extracted = bugs.len();
        dump_bugs(&bugs);
        Ok(bugs)
    }

    /// Post every bug not covered by the resume threshold.
    pub async fn transfer_bugs(&self, bugs: &[Bug], report: &mut MigrationReport) -> Result<()> {
        self.progress
            .set_phase(MigrationPhase::PostingIssues, bugs.len() as u64);
        let mut posted_any = false;

        for bug in bugs {
            let item = format!("Bug #{}", bug.id);
            if self.options.already_migrated(bug.id) {
                debug!(bug_id = bug.id, "Already migrated, skipping");
                report.bugs_skipped += 1;
                self.progress.increment(Some(&item));
                continue;
            }

            if posted_any {
                self.sink.throttle().between_bugs().await;
            }
            posted_any = true;

            match self.sink.post_bug(bug).await {
                Ok(outcome) => {
                    report.issues_created += 1;
                    report.comments_posted += outcome.comments;
                    report.attachments_rehosted += outcome.attachments_rehosted;
                    if outcome.closed {
                        report.issues_closed += 1;
                    }
                }
                Err(e @ MigrationError::TransferFailed { .. })
                    if self.options.attachment_failure == AttachmentFailurePolicy::Skip =>
                {
                    warn!(bug_id = bug.id, error = %e, "Skipping bug with failed attachment");
                    report.bugs_skipped += 1;
                    report.add_error("attachments", &format!("Bug #{}: {e}", bug.id), false);
                }
                Err(e) => {
                    error!(bug_id = bug.id, error = %e, "Failed to post bug");
                    return Err(e);
                }
            }
            self.progress.increment(Some(&item));
        }

        Ok(())
    }
}

fn absorb(report: &mut MigrationReport, outcome: PassOutcome) {
    report.issues_examined += outcome.issues_examined;
    report.issues_updated += outcome.issues_updated;
    report.comments_updated += outcome.comments_updated;
    report.issues_closed += outcome.issues_closed;
    for number in outcome.title_matches {
        report.add_warning(format!(
            "issue #{number} has no legacy bug id and was matched by title"
        ));
    }
}

/// Full rendering of every extracted bug, at trace level (`-vv`).
fn dump_bugs(bugs: &[Bug]) {
    if !tracing::enabled!(tracing::Level::TRACE) {
        return;
    }
    for bug in bugs {
        trace!(bug_id = bug.id, "Extracted bug\n{}", bug.long_form());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::ThrottleConfig;
    use crate::tracker::{IssuePage, IssueUpdate, Metered, RemoteComment, RemoteIssue};
    use crate::transfer::DirectoryStore;
    use async_trait::async_trait;
    use bugport_types::{Attachment, Comment};
    use chrono::NaiveDate;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Records created issue titles.
    #[derive(Default)]
    struct Recorder {
        titles: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl IssueTracker for Recorder {
        async fn create_issue(&self, title: &str, body: &str) -> Result<Metered<RemoteIssue>> {
            let mut titles = self.titles.lock().unwrap();
            titles.push(title.to_string());
            Ok(Metered::new(
                RemoteIssue {
                    number: titles.len() as u64,
                    title: title.to_string(),
                    body: Some(body.to_string()),
                    state: Default::default(),
                },
                5000,
            ))
        }

        async fn create_comment(&self, _issue: u64, body: &str) -> Result<Metered<RemoteComment>> {
            Ok(Metered::new(
                RemoteComment {
                    id: 1,
                    body: body.to_string(),
                },
                5000,
            ))
        }

        async fn update_issue(&self, issue: u64, _update: &IssueUpdate) -> Result<Metered<RemoteIssue>> {
            Ok(Metered::new(
                RemoteIssue {
                    number: issue,
                    title: String::new(),
                    body: None,
                    state: Default::default(),
                },
                5000,
            ))
        }

        async fn update_comment(&self, comment: u64, body: &str) -> Result<Metered<RemoteComment>> {
            Ok(Metered::new(
                RemoteComment {
                    id: comment,
                    body: body.to_string(),
                },
                5000,
            ))
        }

        async fn list_issues(&self, _cursor: Option<&str>) -> Result<Metered<IssuePage>> {
            Ok(Metered::new(IssuePage::default(), 5000))
        }

        async fn list_comments(&self, _issue: u64) -> Result<Metered<Vec<RemoteComment>>> {
            Ok(Metered::new(Vec::new(), 5000))
        }
    }

    fn bug(id: i64) -> Bug {
        let date = NaiveDate::from_ymd_opt(2013, 3, 4)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        Bug {
            id,
            description: format!("bug {id}"),
            priority: String::new(),
            status: "Open".to_string(),
            project: String::new(),
            category: String::new(),
            author: "hol353".to_string(),
            date,
            assignee: String::new(),
            comments: vec![
                Comment::new(id * 10, "hol353", date, "body"),
                Comment::new(id * 10 + 1, "hol353", date, "reply"),
            ],
        }
    }

    fn migrator(options: MigrationOptions) -> Migrator<Recorder> {
        Migrator::with_tracker(
            Recorder::default(),
            MigrationConfig::new("http://legacy.example.org/BugTracker", "owner/repo"),
            options.with_throttle(ThrottleConfig::disabled()),
            RehostLayout::new("https://files.example.org"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_resume_skips_migrated_bugs() {
        let migrator = migrator(MigrationOptions::default().with_resume_after(50));
        let bugs: Vec<_> = [10, 50, 51, 80].into_iter().map(bug).collect();
        let mut report = MigrationReport::new(MigrationMode::Transfer);

        migrator.transfer_bugs(&bugs, &mut report).await.unwrap();

        let titles = migrator.sink().tracker().titles.lock().unwrap().clone();
        assert_eq!(titles, vec!["bug 51", "bug 80"]);
        assert_eq!(report.bugs_skipped, 2);
        assert_eq!(report.issues_created, 2);
        assert_eq!(report.comments_posted, 2);
    }

    #[tokio::test]
    async fn test_reupload_requires_store() {
        let migrator = migrator(MigrationOptions::default().with_reupload(true));
        let err = migrator.run().await.unwrap_err();
        assert!(matches!(err, MigrationError::InvalidConfig(_)));
    }

    async fn failing_attachment_run(
        policy: AttachmentFailurePolicy,
    ) -> (Result<()>, MigrationReport, Vec<String>) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let layout = RehostLayout::new("https://files.example.org");
        let transfer = AttachmentTransfer::new(Box::new(DirectoryStore::new(store.path())), layout)
            .unwrap()
            .with_staging_dir(staging.path());
        let migrator = migrator(
            MigrationOptions::default()
                .with_reupload(true)
                .with_attachment_failure(policy),
        )
        .with_transfer(transfer);

        let mut broken = bug(1);
        broken.comments[1] = broken.comments[1].clone().with_attachment(Attachment::new(
            "a.txt",
            1,
            format!("{}/view_attachment.aspx?id=11", server.uri()),
        ));
        let bugs = vec![broken, bug(2)];

        let mut report = MigrationReport::new(MigrationMode::Transfer);
        let result = migrator.transfer_bugs(&bugs, &mut report).await;
        let titles = migrator.sink().tracker().titles.lock().unwrap().clone();
        (result, report, titles)
    }

    #[tokio::test]
    async fn test_skip_policy_continues_after_failed_attachment() {
        let (result, report, titles) = failing_attachment_run(AttachmentFailurePolicy::Skip).await;
        assert!(result.is_ok());
        assert_eq!(titles, vec!["bug 2"]);
        assert_eq!(report.bugs_skipped, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.is_successful());
    }

    #[tokio::test]
    async fn test_abort_policy_stops_without_partial_issue() {
        let (result, _report, titles) = failing_attachment_run(AttachmentFailurePolicy::Abort).await;
        assert!(matches!(
            result,
            Err(MigrationError::TransferFailed { comment_id: 11, .. })
        ));
        assert!(titles.is_empty());
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn dump_at(level: tracing::Level) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || dump_bugs(&[bug(7)]));
        let bytes = captured.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_bug_dump_only_at_trace() {
        let traced = dump_at(tracing::Level::TRACE);
        assert!(traced.contains("Legacy Bug ID: 7"));
        assert!(traced.contains("COMMENT 1:"));

        assert!(dump_at(tracing::Level::DEBUG).is_empty());
    }

    #[test]
    fn test_title_matches_become_warnings() {
        let mut report = MigrationReport::new(MigrationMode::CloseIssues);
        absorb(
            &mut report,
            PassOutcome {
                issues_examined: 3,
                issues_closed: 1,
                title_matches: vec![4, 9],
                ..Default::default()
            },
        );
        assert_eq!(report.issues_examined, 3);
        assert_eq!(report.warnings.len(), 2);
        assert!(report.warnings[0].contains("#4"));
        assert!(report.is_successful());
    }
}
