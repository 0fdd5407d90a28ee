//! Bug records.

use crate::{Comment, RENDER_DATE_FORMAT};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A bug scraped from the legacy tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bug {
    /// Source-assigned bug id.
    pub id: i64,
    /// One-line description, used as the issue title.
    pub description: String,
    /// Priority label.
    pub priority: String,
    /// Workflow status label.
    pub status: String,
    /// Project the bug was filed against.
    pub project: String,
    /// Category label.
    pub category: String,
    /// Reporter's user name.
    pub author: String,
    /// When the bug was reported.
    pub date: NaiveDateTime,
    /// User the bug is assigned to.
    pub assignee: String,
    /// Thread in chronological order. The first entry is the bug's body.
    pub comments: Vec<Comment>,
}

impl Bug {
    /// Returns true if the legacy status is "closed" in any letter case.
    pub fn is_closed(&self) -> bool {
        self.status.trim().eq_ignore_ascii_case("closed")
    }

    /// Comments posted after the body, in chronological order.
    pub fn replies(&self) -> &[Comment] {
        self.comments.get(1..).unwrap_or_default()
    }

    /// Metadata block placed at the top of the migrated issue.
    ///
    /// The first line is the back-reference used to match issues to legacy
    /// bugs in later maintenance passes.
    pub fn header(&self) -> String {
        let mut out = format!("Legacy Bug ID: {}\n", self.id);
        out.push_str(&format!("Author: {}\n", self.author));
        out.push_str(&format!("Date: {}\n", self.date.format(RENDER_DATE_FORMAT)));
        for (label, value) in [
            ("Priority", &self.priority),
            ("Status", &self.status),
            ("Project", &self.project),
            ("Category", &self.category),
            ("Assignee", &self.assignee),
        ] {
            if !value.is_empty() {
                out.push_str(&format!("{label}: {value}\n"));
            }
        }
        out.push_str(&format!("Title: {}\n", self.description));
        out
    }

    /// Body of the migrated issue: the header plus the first comment's text.
    pub fn issue_body(&self) -> String {
        let mut out = self.header();
        if let Some(first) = self.comments.first() {
            out.push('\n');
            out.push_str(&first.text);
        }
        out
    }

    /// The whole thread rendered as one document.
    pub fn long_form(&self) -> String {
        let mut out = self.issue_body();
        for (i, comment) in self.comments.iter().enumerate().skip(1) {
            out.push_str(&format!("\n\nCOMMENT {i}:\n\n"));
            out.push_str(&comment.render());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2011, 2, day)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    fn bug(status: &str) -> Bug {
        Bug {
            id: 42,
            description: "Soil water crashes".to_string(),
            priority: "3".to_string(),
            status: status.to_string(),
            project: "APSIM".to_string(),
            category: "Bug".to_string(),
            author: "jsmith".to_string(),
            date: at(1),
            assignee: String::new(),
            comments: vec![
                Comment::new(1, "jsmith", at(1), "Steps to reproduce..."),
                Comment::new(2, "hol353", at(2), "Confirmed."),
            ],
        }
    }

    #[test]
    fn test_is_closed_ignores_case() {
        assert!(bug("Closed").is_closed());
        assert!(bug("CLOSED").is_closed());
        assert!(!bug("open").is_closed());
        assert!(!bug("closed pending").is_closed());
    }

    #[test]
    fn test_issue_body_embeds_legacy_id_and_first_comment() {
        let body = bug("open").issue_body();
        assert!(body.starts_with("Legacy Bug ID: 42\n"));
        assert!(body.contains("Title: Soil water crashes\n"));
        assert!(!body.contains("Assignee:"));
        assert!(body.ends_with("\nSteps to reproduce..."));
        assert!(!body.contains("Confirmed."));
    }

    #[test]
    fn test_replies_skip_body() {
        let b = bug("open");
        assert_eq!(b.replies().len(), 1);
        assert_eq!(b.replies()[0].id, 2);

        let mut empty = b.clone();
        empty.comments.clear();
        assert!(empty.replies().is_empty());
    }

    #[test]
    fn test_long_form_numbers_replies() {
        let long = bug("open").long_form();
        assert!(long.contains("\n\nCOMMENT 1:\n\nAuthor: hol353"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let b = bug("open");
        let json = serde_json::to_string(&b).unwrap();
        let back: Bug = serde_json::from_str(&json).unwrap();
        assert_eq!(b, back);
    }
}
