//! Credential files.
//!
//! The API token file holds the token and nothing else. The file store
//! credentials are `username=` and `password=` lines.

use crate::error::{MigrationError, Result};
use std::path::Path;

/// Username and password for the attachment file store.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct FtpCredentials {
    /// Login name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl std::fmt::Debug for FtpCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl FtpCredentials {
    /// Parse `key=value` lines. Unknown keys are ignored.
    pub fn parse(contents: &str) -> Self {
        let mut credentials = Self::default();
        for line in contents.lines() {
            if let Some(username) = line.strip_prefix("username=") {
                credentials.username = username.to_string();
            } else if let Some(password) = line.strip_prefix("password=") {
                credentials.password = password.to_string();
            }
        }
        credentials
    }
}

/// Read an API token.
pub fn read_token(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let token = read(path)?.trim().to_string();
    if token.is_empty() {
        return Err(MigrationError::Credentials(format!(
            "{} is empty",
            path.display()
        )));
    }
    Ok(token)
}

/// Read file store credentials.
pub fn read_ftp_credentials(path: impl AsRef<Path>) -> Result<FtpCredentials> {
    let path = path.as_ref();
    let credentials = FtpCredentials::parse(&read(path)?);
    if credentials.username.is_empty() {
        return Err(MigrationError::Credentials(format!(
            "{} has no username= line",
            path.display()
        )));
    }
    Ok(credentials)
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| MigrationError::Credentials(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_token_trims() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  ghp_abc123  ").unwrap();
        assert_eq!(read_token(file.path()).unwrap(), "ghp_abc123");
    }

    #[test]
    fn test_missing_token_file() {
        let err = read_token("/nonexistent/secret.txt").unwrap_err();
        assert!(matches!(err, MigrationError::Credentials(_)));
    }

    #[test]
    fn test_parse_ftp_credentials() {
        let credentials = FtpCredentials::parse("# store\nusername=uploader\npassword=p=ss\n");
        assert_eq!(credentials.username, "uploader");
        assert_eq!(credentials.password, "p=ss");
        assert!(!format!("{credentials:?}").contains("p=ss"));
    }

    #[test]
    fn test_ftp_credentials_require_username() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "password=x").unwrap();
        assert!(read_ftp_credentials(file.path()).is_err());
    }
}
