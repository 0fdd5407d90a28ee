//! Comment records.

use crate::{Attachment, RENDER_DATE_FORMAT};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A post in a legacy bug's thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    /// Source-assigned comment id.
    pub id: i64,
    /// Author's user name.
    pub author: String,
    /// When the comment was posted.
    pub date: NaiveDateTime,
    /// Plain-text body.
    pub text: String,
    /// File uploaded with the comment, if any.
    pub attachment: Option<Attachment>,
}

impl Comment {
    /// Creates a comment without an attachment.
    pub fn new(
        id: i64,
        author: impl Into<String>,
        date: NaiveDateTime,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id,
            author: author.into(),
            date,
            text: text.into(),
            attachment: None,
        }
    }

    /// Attaches a file.
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = if attachment.is_empty() {
            None
        } else {
            Some(attachment)
        };
        self
    }

    /// Returns true if the comment carries a file.
    pub fn has_attachment(&self) -> bool {
        self.attachment.is_some()
    }

    /// Markdown rendering used as an issue comment body.
    ///
    /// Attachment posts render the file link instead of the text.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Author: {}\nDate: {}\n\n",
            self.author,
            self.date.format(RENDER_DATE_FORMAT)
        );
        match &self.attachment {
            Some(attachment) => out.push_str(&attachment.render()),
            None => out.push_str(&self.text),
        }
        out
    }
}
