//! Attachment records.

use serde::{Deserialize, Serialize};

/// A file attached to a legacy comment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// File name as displayed by the tracker.
    pub name: String,
    /// Size in bytes.
    pub size: i64,
    /// Absolute URL of the file.
    pub url: String,
}

impl Attachment {
    /// Creates a new attachment.
    pub fn new(name: impl Into<String>, size: i64, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            url: url.into(),
        }
    }

    /// Returns true if every field holds its zero value.
    ///
    /// The extractor never produces such a record; it is recognised so that
    /// callers converting from loosely typed data can map it to `None`.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.size == 0 && self.url.is_empty()
    }

    /// File name with spaces replaced by underscores.
    ///
    /// Only the last path component of the scraped name is kept. Returns
    /// `None` when nothing usable is left (empty, `.` or `..`).
    pub fn clean_file_name(&self) -> Option<String> {
        clean_file_name(&self.name)
    }

    /// Returns a copy pointing at a different URL.
    pub fn with_url(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..self.clone()
        }
    }

    /// Markdown rendering: a link followed by the size.
    pub fn render(&self) -> String {
        format!("[{}]({})\nSize: {}", self.name, self.url, self.size)
    }
}

/// Last path component of `name` with spaces replaced by underscores.
pub fn clean_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    match last {
        "" | "." | ".." => None,
        last => Some(last.replace(' ', "_")),
    }
}
