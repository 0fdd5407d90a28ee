//! Posting bugs to the destination tracker and maintaining them afterwards.
//!
//! Every remote call goes through [`IssueSink::retry`], which repeats calls
//! rejected by abuse detection or the primary rate limit, and every
//! successful write is followed by a [`Throttle`] pause.

use crate::error::{MigrationError, Result};
use crate::progress::{pagination_percentage, MigrationPhase, MigrationProgress};
use crate::throttle::{Throttle, WriteKind};
use crate::tracker::{IssueTracker, IssueUpdate, Metered, RemoteComment, RemoteIssue};
use crate::transfer::{relocate, AttachmentTransfer, RehostLayout};

use bugport_types::{Bug, Comment};
use regex::Regex;
use std::future::Future;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static LEGACY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Legacy Bug ID: (\d+)").expect("valid regex"));
static OLD_LEGACY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Bug #(\d+)").expect("valid regex"));

/// Reads the legacy bug id out of an issue body.
///
/// Bodies written by this tool carry `Legacy Bug ID: N`; older migrations
/// used `Bug #N`. `None` means neither is present and the caller should fall
/// back to matching by title.
pub fn legacy_id(body: &str) -> Option<i64> {
    [&*LEGACY_ID, &*OLD_LEGACY_ID].into_iter().find_map(|re| {
        re.captures(body)
            .and_then(|caps| caps.get(1))
            .and_then(|id| id.as_str().parse().ok())
    })
}

/// Finds the legacy bug a remote issue was migrated from.
pub fn match_legacy<'a>(bugs: &'a [Bug], issue: &RemoteIssue) -> Result<&'a Bug> {
    match legacy_id(issue.body()) {
        Some(id) => bugs
            .iter()
            .find(|bug| bug.id == id)
            .ok_or_else(|| MigrationError::UnmatchedIssue {
                number: issue.number,
                detail: format!("legacy bug {id} was not extracted"),
            }),
        None => {
            warn!(
                issue = issue.number,
                "Unable to determine legacy bug id, resorting to title match"
            );
            bugs.iter()
                .find(|bug| bug.description == issue.title)
                .ok_or_else(|| MigrationError::UnmatchedIssue {
                    number: issue.number,
                    detail: format!("no legacy bug titled {:?}", issue.title),
                })
        }
    }
}

/// Rewrites markdown links whose target lacks a scheme.
///
/// `[name](www.example.org/x)` becomes `[name](https://www.example.org/x)`.
#[derive(Debug, Clone)]
pub struct SchemeFix {
    pattern: Regex,
    replacement: String,
}

impl SchemeFix {
    /// Fix links pointing at `host`.
    pub fn new(host: &str) -> Result<Self> {
        let pattern = Regex::new(&format!(r"(\[[^\]]+\])\({}", regex::escape(host)))
            .map_err(|e| MigrationError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            pattern,
            replacement: format!("${{1}}(https://{}", host.replace('$', "$$")),
        })
    }

    /// The rewritten text, or `None` if nothing matched.
    pub fn apply(&self, text: &str) -> Option<String> {
        self.pattern
            .is_match(text)
            .then(|| self.pattern.replace_all(text, self.replacement.as_str()).into_owned())
    }
}

/// Rewrites markdown links into the legacy tracker so they point at the
/// re-hosted copy of the attachment.
#[derive(Debug, Clone)]
pub struct AttachmentLinkFix {
    pattern: Regex,
    layout: RehostLayout,
}

impl AttachmentLinkFix {
    /// Fix links under `legacy_root`, pointing them into `layout`.
    pub fn new(legacy_root: &str, layout: RehostLayout) -> Result<Self> {
        let root = regex::escape(legacy_root.trim_end_matches('/'));
        let pattern = Regex::new(&format!(r"\[([^\]]+)\]\({root}[^\)]*\)"))
            .map_err(|e| MigrationError::InvalidConfig(e.to_string()))?;
        Ok(Self { pattern, layout })
    }

    /// The rewritten text, or `None` if nothing matched.
    ///
    /// The link text names the attachment; its owner is the first comment
    /// of `bug` whose text contains it. Each link is resolved on its own.
    pub fn apply(&self, text: &str, bug: &Bug, issue: u64) -> Result<Option<String>> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in self.pattern.captures_iter(text) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let owner = owning_comment(&bug.comments, name.as_str()).ok_or_else(|| {
                MigrationError::UnmatchedIssue {
                    number: issue,
                    detail: format!("no comment of legacy bug {} mentions {:?}", bug.id, name.as_str()),
                }
            })?;
            let url = self.layout.url(owner.id, name.as_str()).ok_or_else(|| {
                MigrationError::UnmatchedIssue {
                    number: issue,
                    detail: format!("link text {:?} has no usable file name", name.as_str()),
                }
            })?;
            out.push_str(&text[last..whole.start()]);
            out.push_str(&format!("[{}]({url})", name.as_str()));
            last = whole.end();
        }

        if last == 0 {
            return Ok(None);
        }
        out.push_str(&text[last..]);
        Ok(Some(out))
    }
}

fn owning_comment<'a>(comments: &'a [Comment], content: &str) -> Option<&'a Comment> {
    comments.iter().find(|comment| comment.text.contains(content))
}

/// How attachments are treated when a bug is posted.
pub enum AttachmentHandling {
    /// Leave links pointing at the legacy tracker.
    Keep,
    /// Point links at files uploaded by an earlier run.
    Relocate(RehostLayout),
    /// Download and upload every attachment.
    Rehost(AttachmentTransfer),
}

/// Result of posting one bug.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostOutcome {
    /// Number of the created issue.
    pub issue: u64,
    /// Comments created on it.
    pub comments: usize,
    /// Attachments downloaded and uploaded.
    pub attachments_rehosted: usize,
    /// Whether the issue was closed after posting.
    pub closed: bool,
}

/// Counts from a maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassOutcome {
    /// Issues looked at.
    pub issues_examined: usize,
    /// Issue bodies rewritten.
    pub issues_updated: usize,
    /// Comment bodies rewritten.
    pub comments_updated: usize,
    /// Issues closed.
    pub issues_closed: usize,
    /// Issues matched to their legacy bug by title rather than id.
    pub title_matches: Vec<u64>,
}

impl PassOutcome {
    fn match_legacy<'a>(&mut self, bugs: &'a [Bug], issue: &RemoteIssue) -> Result<&'a Bug> {
        let bug = match_legacy(bugs, issue)?;
        if legacy_id(issue.body()).is_none() {
            self.title_matches.push(issue.number);
        }
        Ok(bug)
    }
}

/// Writes legacy bugs to an [`IssueTracker`].
pub struct IssueSink<T> {
    tracker: T,
    throttle: Throttle,
    attachments: AttachmentHandling,
}

impl<T: IssueTracker> IssueSink<T> {
    /// Create a sink that leaves attachment links untouched.
    pub fn new(tracker: T, throttle: Throttle) -> Self {
        Self {
            tracker,
            throttle,
            attachments: AttachmentHandling::Keep,
        }
    }

    /// Set how attachments are handled.
    pub fn with_attachments(mut self, attachments: AttachmentHandling) -> Self {
        self.attachments = attachments;
        self
    }

    /// Returns true if attachments are downloaded and uploaded again.
    pub fn rehosts(&self) -> bool {
        matches!(self.attachments, AttachmentHandling::Rehost(_))
    }

    /// The underlying tracker.
    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    /// The throttle in use.
    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    /// Run `call` until it succeeds or fails with a non-retryable error.
    ///
    /// Abuse-detection rejections wait a random backoff; rate-limit
    /// rejections wait for the quota reset. The identical call is repeated.
    pub async fn retry<R, F, Fut>(&self, what: &str, mut call: F) -> Result<Metered<R>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Metered<R>>>,
    {
        loop {
            match call().await {
                Err(MigrationError::AbuseDetected(message)) => {
                    debug!(call = what, message = %message, "Retrying after abuse detection");
                    self.throttle.abuse_backoff().await;
                }
                Err(MigrationError::RateLimitExceeded(secs)) => {
                    debug!(call = what, secs, "Retrying after rate limit");
                    self.throttle.rate_limited(secs).await;
                }
                other => return other,
            }
        }
    }

    async fn prepare_replies(&self, bug: &Bug) -> Result<(Vec<Comment>, usize)> {
        let mut replies = Vec::with_capacity(bug.replies().len());
        let mut rehosted = 0;
        for reply in bug.replies() {
            let prepared = match &self.attachments {
                AttachmentHandling::Keep => reply.clone(),
                AttachmentHandling::Relocate(layout) => relocate(reply, layout),
                AttachmentHandling::Rehost(transfer) => {
                    if reply.has_attachment() {
                        rehosted += 1;
                    }
                    transfer.rehost(reply).await?
                }
            };
            replies.push(prepared);
        }
        Ok((replies, rehosted))
    }

    /// Create the issue for `bug` with all of its comments.
    ///
    /// Attachments are handled before anything is written, so a transfer
    /// failure leaves no partial issue behind.
    pub async fn post_bug(&self, bug: &Bug) -> Result<PostOutcome> {
        let (replies, attachments_rehosted) = self.prepare_replies(bug).await?;

        let tracker = &self.tracker;
        let title = bug.description.as_str();
        let body = bug.issue_body();
        let body = body.as_str();
        let created = self
            .retry("create issue", move || tracker.create_issue(title, body))
            .await?;
        let issue = created.data.number;
        info!(bug_id = bug.id, issue, "Created issue");
        self.throttle.after_write(created.remaining, WriteKind::Create).await;

        let mut outcome = PostOutcome {
            issue,
            attachments_rehosted,
            ..Default::default()
        };

        for reply in &replies {
            let text = reply.render();
            let text = text.as_str();
            let posted = self
                .retry("create comment", move || tracker.create_comment(issue, text))
                .await?;
            debug!(bug_id = bug.id, issue, comment_id = reply.id, "Posted comment");
            outcome.comments += 1;
            self.throttle.after_write(posted.remaining, WriteKind::Create).await;
        }

        if bug.is_closed() {
            self.close(issue).await?;
            outcome.closed = true;
        }

        Ok(outcome)
    }

    async fn close(&self, issue: u64) -> Result<()> {
        let tracker = &self.tracker;
        let update = IssueUpdate::close();
        let update = &update;
        let closed = self
            .retry("close issue", move || tracker.update_issue(issue, update))
            .await?;
        info!(issue, "Closed issue");
        self.throttle.after_write(closed.remaining, WriteKind::Update).await;
        Ok(())
    }

    async fn update_body(&self, issue: u64, body: String) -> Result<()> {
        let tracker = &self.tracker;
        let update = IssueUpdate::body(body);
        let update = &update;
        let updated = self
            .retry("update issue", move || tracker.update_issue(issue, update))
            .await?;
        self.throttle.after_write(updated.remaining, WriteKind::Update).await;
        Ok(())
    }

    async fn update_comment(&self, comment: u64, body: &str) -> Result<()> {
        let tracker = &self.tracker;
        let updated = self
            .retry("update comment", move || tracker.update_comment(comment, body))
            .await?;
        self.throttle.after_write(updated.remaining, WriteKind::Update).await;
        Ok(())
    }

    /// Page through remote issues, newest first, stopping after `max`.
    pub async fn list_issues(
        &self,
        max: Option<usize>,
        progress: &MigrationProgress,
    ) -> Result<Vec<RemoteIssue>> {
        progress.set_phase(MigrationPhase::FetchingIssues, 100);
        let tracker = &self.tracker;
        let mut issues: Vec<RemoteIssue> = Vec::new();
        let mut cursor: Option<String> = None;
        let mut first_number = None;

        loop {
            let page_cursor = cursor.as_deref();
            let page = self
                .retry("list issues", move || tracker.list_issues(page_cursor))
                .await?;
            self.throttle.after_read(page.remaining).await;

            for issue in page.data.issues {
                if max.is_some_and(|max| issues.len() >= max) {
                    break;
                }
                let first = *first_number.get_or_insert(issue.number);
                let pct = pagination_percentage(first, issue.number);
                progress.set_completed(pct as u64, None);
                issues.push(issue);
            }

            if max.is_some_and(|max| issues.len() >= max) {
                break;
            }
            match page.data.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        progress.set_completed(100, None);
        info!(count = issues.len(), "Fetched remote issues");
        Ok(issues)
    }

    /// Add the missing scheme to links in every comment of `issues`.
    pub async fn fix_links(
        &self,
        issues: &[RemoteIssue],
        fix: &SchemeFix,
        progress: &MigrationProgress,
    ) -> Result<PassOutcome> {
        progress.set_phase(MigrationPhase::FixingLinks, issues.len() as u64);
        let mut outcome = PassOutcome::default();

        for issue in issues {
            outcome.issues_examined += 1;
            for comment in self.comments_of(issue.number).await? {
                let Some(body) = fix.apply(&comment.body) else {
                    continue;
                };
                debug!(issue = issue.number, comment = comment.id, "Fixing link scheme");
                self.update_comment(comment.id, &body).await?;
                outcome.comments_updated += 1;
            }
            progress.increment(Some(&format!("#{}", issue.number)));
        }

        Ok(outcome)
    }

    /// Point links into the legacy tracker at re-hosted attachments.
    pub async fn fix_links_v2(
        &self,
        issues: &[RemoteIssue],
        bugs: &[Bug],
        fix: &AttachmentLinkFix,
        progress: &MigrationProgress,
    ) -> Result<PassOutcome> {
        progress.set_phase(MigrationPhase::FixingLinks, issues.len() as u64);
        let mut outcome = PassOutcome::default();

        for issue in issues {
            outcome.issues_examined += 1;
            let comments = self.comments_of(issue.number).await?;
            let mut bug = None;
            for comment in comments {
                if !fix.pattern.is_match(&comment.body) {
                    continue;
                }
                let legacy = match bug {
                    Some(found) => found,
                    None => *bug.insert(outcome.match_legacy(bugs, issue)?),
                };
                if let Some(body) = fix.apply(&comment.body, legacy, issue.number)? {
                    debug!(issue = issue.number, comment = comment.id, "Relinking attachment");
                    self.update_comment(comment.id, &body).await?;
                    outcome.comments_updated += 1;
                }
            }
            progress.increment(Some(&format!("#{}", issue.number)));
        }

        Ok(outcome)
    }

    /// Strip tab characters from issue and comment bodies.
    pub async fn fix_formatting(
        &self,
        issues: &[RemoteIssue],
        progress: &MigrationProgress,
    ) -> Result<PassOutcome> {
        progress.set_phase(MigrationPhase::FixingFormatting, issues.len() as u64);
        let mut outcome = PassOutcome::default();

        for issue in issues {
            outcome.issues_examined += 1;
            if issue.body().contains('\t') {
                debug!(issue = issue.number, "Replacing tabs in issue body");
                self.update_body(issue.number, issue.body().replace('\t', ""))
                    .await?;
                outcome.issues_updated += 1;
            }

            for comment in self.comments_of(issue.number).await? {
                if comment.body.contains('\t') {
                    debug!(issue = issue.number, comment = comment.id, "Replacing tabs in comment");
                    self.update_comment(comment.id, &comment.body.replace('\t', ""))
                        .await?;
                    outcome.comments_updated += 1;
                }
            }
            progress.increment(Some(&format!("#{}", issue.number)));
        }

        Ok(outcome)
    }

    /// Close every open issue whose legacy bug is closed.
    pub async fn close_sync(
        &self,
        issues: &[RemoteIssue],
        bugs: &[Bug],
        progress: &MigrationProgress,
    ) -> Result<PassOutcome> {
        progress.set_phase(MigrationPhase::ClosingIssues, issues.len() as u64);
        let mut outcome = PassOutcome::default();

        for issue in issues {
            outcome.issues_examined += 1;
            let bug = outcome.match_legacy(bugs, issue)?;
            if bug.is_closed() && !issue.is_closed() {
                info!(bug_id = bug.id, issue = issue.number, "Closing issue");
                self.close(issue.number).await?;
                outcome.issues_closed += 1;
            } else {
                debug!(bug_id = bug.id, issue = issue.number, "Skipping issue");
            }
            progress.increment(Some(&format!("#{}", issue.number)));
        }

        Ok(outcome)
    }

    async fn comments_of(&self, issue: u64) -> Result<Vec<RemoteComment>> {
        let tracker = &self.tracker;
        let comments = self
            .retry("list comments", move || tracker.list_comments(issue))
            .await?;
        self.throttle.after_read(comments.remaining).await;
        Ok(comments.data)
    }
}
