//! Record types shared by the `bugport` crates.
//!
//! A [`Bug`] is one row of the legacy tracker's bug list together with the
//! thread of [`Comment`]s found on its detail page. Comments may carry a
//! single [`Attachment`].

mod attachment;
mod bug;
mod comment;

pub use attachment::{clean_file_name, Attachment};
pub use bug::Bug;
pub use comment::Comment;

/// Timestamp layout used when rendering dates into issue bodies.
pub const RENDER_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
