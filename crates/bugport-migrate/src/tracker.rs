//! Remote issue tracker interface.
//!
//! [`IssueSink`](crate::sink::IssueSink) only talks to the destination
//! through [`IssueTracker`]. Every call reports the remaining request quota
//! next to its data.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Remote issue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    #[default]
    Open,
    Closed,
}

/// An issue on the destination tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIssue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub state: IssueState,
}

impl RemoteIssue {
    /// Body text, empty when the issue has none.
    pub fn body(&self) -> &str {
        self.body.as_deref().unwrap_or_default()
    }

    /// Returns true if the issue is closed.
    pub fn is_closed(&self) -> bool {
        self.state == IssueState::Closed
    }
}

/// A comment on the destination tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteComment {
    pub id: u64,
    #[serde(default)]
    pub body: String,
}

/// Fields to change on an issue. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IssueUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<IssueState>,
}

impl IssueUpdate {
    /// Close the issue.
    pub fn close() -> Self {
        Self {
            state: Some(IssueState::Closed),
            ..Default::default()
        }
    }

    /// Replace the body.
    pub fn body(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..Default::default()
        }
    }
}

/// One page of an issue listing.
#[derive(Debug, Clone, Default)]
pub struct IssuePage {
    pub issues: Vec<RemoteIssue>,
    /// Cursor for the following page, if any.
    pub next: Option<String>,
}

/// Response data plus the remaining request quota.
#[derive(Debug, Clone)]
pub struct Metered<T> {
    pub data: T,
    pub remaining: u64,
}

impl<T> Metered<T> {
    /// Wrap a value.
    pub fn new(data: T, remaining: u64) -> Self {
        Self { data, remaining }
    }
}

/// Operations the migration needs from an issue tracker.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Open a new issue.
    async fn create_issue(&self, title: &str, body: &str) -> Result<Metered<RemoteIssue>>;

    /// Add a comment to an issue.
    async fn create_comment(&self, issue: u64, body: &str) -> Result<Metered<RemoteComment>>;

    /// Change an issue's body or state.
    async fn update_issue(&self, issue: u64, update: &IssueUpdate) -> Result<Metered<RemoteIssue>>;

    /// Replace a comment's body.
    async fn update_comment(&self, comment: u64, body: &str) -> Result<Metered<RemoteComment>>;

    /// List issues, newest first. `None` requests the first page.
    async fn list_issues(&self, cursor: Option<&str>) -> Result<Metered<IssuePage>>;

    /// All comments of an issue, oldest first.
    async fn list_comments(&self, issue: u64) -> Result<Metered<Vec<RemoteComment>>>;
}
