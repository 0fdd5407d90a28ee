//! Scraping of the legacy BugTracker.NET site.
//!
//! The bug list comes from `print_bugs.aspx`, which only renders for a
//! session started by `bugs.aspx`. Each bug's thread is read from
//! `edit_bug.aspx?id=N`, where posts are listed newest first.

use crate::error::{MigrationError, Result};
use crate::progress::{MigrationPhase, MigrationProgress};

use bugport_types::{Attachment, Bug, Comment};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use reqwest::header::{HeaderMap, COOKIE, SET_COOKIE};
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use tracing::{debug, error, info};
use url::Url;

/// Date layout of the bug list, e.g. `3/14/2009 2:05:09 PM`.
pub const BUG_DATE_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";

/// Date layout of comment headers, e.g. `2009-3-14 2:05 PM`.
pub const COMMENT_DATE_FORMAT: &str = "%Y-%m-%d %I:%M %p";

/// Date layout of the one comment header without a time, e.g. `2009-3-14`.
pub const SHORT_COMMENT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Comments on the production tracker whose records are irrecoverably broken.
pub const LEGACY_DENYLIST: [i64; 50] = [
    686, 688, 32121, 32124, 32125, 32284, 32287, 32295, 32311, 32331, 32355, 32380, 32394, 32396,
    32397, 32420, 32479, 32544, 32605, 32683, 32717, 32774, 32775, 32848, 32767, 32938, 32939,
    32984, 33012, 33438, 33552, 33888, 33926, 33950, 33951, 34103, 34108, 34109, 34113, 34116,
    34128, 34131, 34132, 33525, 33542, 33666, 33945, 33955, 34122, 34134,
];

/// Number of columns in a bug list row.
const BUG_COLUMNS: usize = 9;

/// Site layout and data workarounds used while scraping.
#[derive(Debug, Clone)]
pub struct ExtractionRules {
    /// Comment ids to drop.
    pub denylist: HashSet<i64>,
    /// Page that starts the session, relative to the root.
    pub session_path: String,
    /// Printable bug list, relative to the root.
    pub list_path: String,
    /// Thread page, relative to the root; the bug id is appended.
    pub thread_path: String,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self {
            denylist: LEGACY_DENYLIST.into_iter().collect(),
            session_path: "bugs.aspx?qu_id=1".to_string(),
            list_path: "print_bugs.aspx".to_string(),
            thread_path: "edit_bug.aspx?id=".to_string(),
        }
    }
}

impl ExtractionRules {
    /// Replace the denylist.
    pub fn with_denylist(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.denylist = ids.into_iter().collect();
        self
    }

    /// Returns true if the comment must be dropped.
    pub fn is_denied(&self, comment_id: i64) -> bool {
        self.denylist.contains(&comment_id)
    }
}

/// One data row of the bug list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BugRow {
    pub id: i64,
    pub priority: String,
    pub status: String,
    pub description: String,
    pub project: String,
    pub category: String,
    pub author: String,
    pub date: NaiveDateTime,
    pub assignee: String,
}

impl BugRow {
    /// Combine the row with its thread.
    pub fn into_bug(self, comments: Vec<Comment>) -> Bug {
        Bug {
            id: self.id,
            description: self.description,
            priority: self.priority,
            status: self.status,
            project: self.project,
            category: self.category,
            author: self.author,
            date: self.date,
            assignee: self.assignee,
            comments,
        }
    }
}

/// Whether a post is a plain comment or a file upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostKind {
    Comment,
    File,
}

/// Parsed header line of a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentMetadata {
    pub kind: PostKind,
    pub id: i64,
    pub author: String,
    pub date: NaiveDateTime,
    /// False for the date-only header variant.
    pub has_time: bool,
}

/// Why a post header could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataDefect {
    /// The normalised header text.
    pub metadata: String,
    /// Token that failed, if any.
    pub token_index: Option<usize>,
    pub reason: String,
}

impl std::fmt::Display for MetadataDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.token_index {
            Some(index) => write!(
                f,
                "{} (token {index} of {:?})",
                self.reason, self.metadata
            ),
            None => write!(f, "{} ({:?})", self.reason, self.metadata),
        }
    }
}

/// Replace non-breaking spaces with regular spaces.
pub fn normalize_spaces(text: &str) -> String {
    text.replace('\u{a0}', " ")
}

/// Parse a post header such as
/// `comment 31877 posted by hol353 2009-3-14 2:05 PM, (5 days ago)`.
///
/// The date sits at a fixed distance from the end of the line. When the token
/// that normally holds the time has no colon, the header is the date-only
/// variant and the date is read from the token after it.
pub fn parse_comment_metadata(raw: &str) -> std::result::Result<CommentMetadata, MetadataDefect> {
    let metadata = normalize_spaces(raw.trim());
    let tokens: Vec<&str> = metadata.split_whitespace().collect();
    let defect = |token_index: Option<usize>, reason: String| MetadataDefect {
        metadata: metadata.clone(),
        token_index,
        reason,
    };

    if tokens.len() < 6 {
        return Err(defect(
            None,
            format!("expected at least 6 tokens, found {}", tokens.len()),
        ));
    }

    let kind = if tokens[0] == "file" {
        PostKind::File
    } else {
        PostKind::Comment
    };
    let id = tokens[1]
        .parse::<i64>()
        .map_err(|e| defect(Some(1), format!("invalid comment id: {e}")))?;
    let author = tokens[4].to_string();

    let n = tokens.len() - 1;
    let (date, has_time) = if tokens[n - 4].contains(':') {
        let text = format!(
            "{} {} {}",
            tokens[n - 5],
            tokens[n - 4],
            tokens[n - 3].trim_matches(',')
        );
        let date = NaiveDateTime::parse_from_str(&text, COMMENT_DATE_FORMAT)
            .map_err(|e| defect(Some(n - 5), format!("invalid date {text:?}: {e}")))?;
        (date, true)
    } else {
        let text = tokens[n - 3].trim_matches(',');
        let date = NaiveDate::parse_from_str(text, SHORT_COMMENT_DATE_FORMAT)
            .map_err(|e| defect(Some(n - 3), format!("invalid date {text:?}: {e}")))?;
        (date.and_time(NaiveTime::MIN), false)
    };

    Ok(CommentMetadata {
        kind,
        id,
        author,
        date,
        has_time,
    })
}

/// Render a post date in the layout it was parsed from, without padding.
pub fn render_comment_date(date: &NaiveDateTime, has_time: bool) -> String {
    if has_time {
        date.format("%Y-%-m-%-d %-I:%M %p").to_string()
    } else {
        date.format("%Y-%-m-%-d").to_string()
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css)
        .map_err(|e| MigrationError::MarkupMismatch(format!("invalid selector {css}: {e:?}")))
}

fn element_text(element: &ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Parse the printable bug list.
///
/// The first row is the column header, whatever cells it is made of. Later
/// rows without a full set of cells (footers) are skipped. At most `cap` data
/// rows are returned.
pub fn parse_bug_list(html: &str, cap: Option<usize>) -> Result<Vec<BugRow>> {
    let document = Html::parse_document(html);
    let rows = selector("table.bugt tr")?;
    let cells = selector("td")?;
    let limit = cap.unwrap_or(usize::MAX);

    let mut bugs = Vec::new();
    for (index, row) in document.select(&rows).enumerate() {
        if bugs.len() >= limit {
            break;
        }
        if index == 0 {
            continue;
        }
        let columns: Vec<String> = row.select(&cells).map(|c| element_text(&c)).collect();
        if columns.len() < BUG_COLUMNS {
            debug!(row = index, cells = columns.len(), "Skipping non-bug row");
            continue;
        }
        bugs.push(parse_bug_row(index, &columns)?);
    }
    Ok(bugs)
}

fn parse_bug_row(index: usize, columns: &[String]) -> Result<BugRow> {
    let id = columns[0].parse::<i64>().map_err(|e| {
        MigrationError::MarkupMismatch(format!("row {index}: invalid bug id {:?}: {e}", columns[0]))
    })?;
    let date = NaiveDateTime::parse_from_str(&columns[7], BUG_DATE_FORMAT).map_err(|e| {
        error!(bug_id = id, date = %columns[7], "Error parsing bug date");
        MigrationError::DataDefect {
            bug_id: id,
            reason: format!("invalid date {:?}: {e}", columns[7]),
        }
    })?;

    Ok(BugRow {
        id,
        priority: columns[1].clone(),
        status: columns[2].clone(),
        description: columns[3].clone(),
        project: columns[4].clone(),
        category: columns[5].clone(),
        author: columns[6].replace(':', ""),
        date,
        assignee: columns[8].clone(),
    })
}

/// Parse a bug's thread page into chronological comments.
pub fn parse_thread(
    html: &str,
    bug_id: i64,
    root: &Url,
    rules: &ExtractionRules,
) -> Result<Vec<Comment>> {
    let document = Html::parse_document(html);
    let blocks = selector(".cmt")?;
    let body = selector("table:nth-child(2)")?;
    let header = selector("span.pst")?;
    let info = selector(".pst")?;
    let icon = selector("img")?;

    let mut comments = Vec::new();
    for block in document.select(&blocks) {
        let text = block
            .select(&body)
            .next()
            .map(|t| element_text(&t))
            .unwrap_or_default();
        let raw = block
            .select(&header)
            .next()
            .map(|h| element_text(&h))
            .unwrap_or_default();

        let metadata = match parse_comment_metadata(&raw) {
            Ok(metadata) => metadata,
            Err(defect) if header_id(&defect.metadata).is_some_and(|id| rules.is_denied(id)) => {
                debug!(bug_id, metadata = %defect.metadata, "Dropping denylisted comment");
                continue;
            }
            Err(defect) => {
                error!(
                    bug_id,
                    metadata = %defect.metadata,
                    token_index = ?defect.token_index,
                    "Error parsing comment header"
                );
                return Err(MigrationError::DataDefect {
                    bug_id,
                    reason: defect.to_string(),
                });
            }
        };

        if rules.is_denied(metadata.id) {
            debug!(bug_id, comment_id = metadata.id, "Dropping denylisted comment");
            continue;
        }

        let mut comment = Comment::new(metadata.id, metadata.author, metadata.date, text);
        if metadata.kind == PostKind::File {
            let attachment = parse_attachment(&block, &icon, &info, root).map_err(|reason| {
                MigrationError::MarkupMismatch(format!(
                    "bug #{bug_id}, comment #{}: {reason}",
                    metadata.id
                ))
            })?;
            comment = comment.with_attachment(attachment);
        }
        comments.push(comment);
    }

    comments.reverse();
    Ok(comments)
}

fn header_id(metadata: &str) -> Option<i64> {
    metadata.split_whitespace().nth(1)?.parse().ok()
}

fn parse_attachment(
    block: &ElementRef<'_>,
    icon: &Selector,
    info: &Selector,
    root: &Url,
) -> std::result::Result<Attachment, String> {
    let img = block.select(icon).next().ok_or("no attachment icon")?;
    let holder = img
        .parent()
        .and_then(ElementRef::wrap)
        .ok_or("attachment icon has no parent")?;
    let name_node = next_element(&holder).ok_or("no attachment name")?;
    let link = next_element(&name_node).ok_or("no attachment link")?;
    let href = link.value().attr("href").ok_or("attachment link has no href")?;
    let url = root
        .join(href)
        .map_err(|e| format!("invalid attachment href {href:?}: {e}"))?;

    let size_text = block
        .select(info)
        .last()
        .map(|s| normalize_spaces(&element_text(&s)))
        .ok_or("no attachment size")?;
    let size = size_text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| format!("invalid attachment size {size_text:?}"))?;

    Ok(Attachment::new(element_text(&name_node), size, url.as_str()))
}

fn next_element<'a>(element: &ElementRef<'a>) -> Option<ElementRef<'a>> {
    element.next_siblings().find_map(ElementRef::wrap)
}

/// Collect `name=value` pairs from `Set-Cookie` headers into a `Cookie` value.
pub fn session_cookies(headers: &HeaderMap) -> Option<String> {
    let pairs: Vec<&str> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .collect();
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}

/// Reads bugs from the legacy site.
pub struct Extractor {
    client: Client,
    root: Url,
    rules: ExtractionRules,
}

impl Extractor {
    /// Create an extractor for the tracker rooted at `source_url`.
    pub fn new(source_url: &str, rules: ExtractionRules) -> Result<Self> {
        let client = Client::builder()
            .user_agent("bugport")
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| MigrationError::NetworkError(e.to_string()))?;

        Ok(Self {
            client,
            root: Url::parse(source_url)?,
            rules,
        })
    }

    /// Rules in use.
    pub fn rules(&self) -> &ExtractionRules {
        &self.rules
    }

    /// Root URL of the tracker.
    pub fn root(&self) -> &Url {
        &self.root
    }

    async fn get(&self, url: Url, cookie: Option<&str>) -> Result<reqwest::Response> {
        let mut request = self.client.get(url.clone());
        if let Some(cookie) = cookie {
            request = request.header(COOKIE, cookie);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MigrationError::NetworkError(format!("GET {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(MigrationError::NetworkError(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        Ok(response)
    }

    /// Fetch the bug list, starting a session first.
    pub async fn fetch_bug_list(&self) -> Result<String> {
        let session = self
            .get(self.root.join(&self.rules.session_path)?, None)
            .await?;
        let cookies = session_cookies(session.headers());
        debug!(has_cookies = cookies.is_some(), "Session started");

        let list = self
            .get(self.root.join(&self.rules.list_path)?, cookies.as_deref())
            .await?;
        Ok(list.text().await?)
    }

    /// Fetch one bug's thread page.
    pub async fn fetch_thread(&self, bug_id: i64) -> Result<String> {
        let url = self
            .root
            .join(&format!("{}{bug_id}", self.rules.thread_path))?;
        Ok(self.get(url, None).await?.text().await?)
    }

    /// Extract up to `cap` bugs with their threads, in list order.
    pub async fn extract(&self, cap: Option<usize>, progress: &MigrationProgress) -> Result<Vec<Bug>> {
        progress.set_phase(MigrationPhase::Extracting, 0);
        progress.message("Downloading bug list...");
        let list = self.fetch_bug_list().await?;
        let rows = parse_bug_list(&list, cap)?;
        info!(bugs = rows.len(), "Parsed bug list");

        progress.set_phase(MigrationPhase::Extracting, rows.len() as u64);
        let mut bugs = Vec::with_capacity(rows.len());
        for row in rows {
            let thread = self.fetch_thread(row.id).await?;
            let comments = parse_thread(&thread, row.id, &self.root, &self.rules)?;
            debug!(bug_id = row.id, comments = comments.len(), "Extracted bug");
            progress.increment(Some(&format!("Bug #{}", row.id)));
            bugs.push(row.into_bug(comments));
        }
        Ok(bugs)
    }
}
