//! Attachment re-hosting.
//!
//! Files are downloaded from the legacy tracker into a staging directory and
//! uploaded to a file store under `{remote_root}/{comment_id}/`, which is
//! served publicly from `public_base`.

use crate::credentials::FtpCredentials;
use crate::error::{MigrationError, Result};

use async_trait::async_trait;
use bugport_types::{clean_file_name, Attachment, Comment};
use reqwest::Client;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Default directory, relative to the store root, holding re-hosted files.
pub const DEFAULT_REMOTE_ROOT: &str = "BugAttachments";

/// A place attachments can be uploaded to.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Copy `local` into `remote_dir`, creating the directory if needed.
    ///
    /// Returns the stored file's path relative to the store root.
    async fn store(&self, remote_dir: &str, local: &Path) -> Result<String>;
}

fn file_name(local: &Path) -> Result<String> {
    local
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            MigrationError::InvalidConfig(format!("{} has no file name", local.display()))
        })
}

/// Connection settings for [`FtpStore`].
#[derive(Debug, Clone)]
pub struct FtpConfig {
    /// Server host name.
    pub host: String,
    /// Control port.
    pub port: u16,
    /// Directory to change into after login; uploads are relative to it.
    pub web_root: String,
    /// Login.
    pub credentials: FtpCredentials,
    /// Connect timeout.
    pub connect_timeout: Duration,
}

impl FtpConfig {
    /// Settings for `host` with the default port, web root and timeout.
    pub fn new(host: impl Into<String>, credentials: FtpCredentials) -> Self {
        Self {
            host: host.into(),
            port: 21,
            web_root: "APSIM".to_string(),
            credentials,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the web root.
    pub fn with_web_root(mut self, web_root: impl Into<String>) -> Self {
        self.web_root = web_root.into();
        self
    }
}

/// Uploads over FTP. Each upload uses its own session.
pub struct FtpStore {
    config: FtpConfig,
}

impl FtpStore {
    /// Create a store.
    pub fn new(config: FtpConfig) -> Self {
        Self { config }
    }
}

fn ftp_error(e: FtpError) -> MigrationError {
    MigrationError::NetworkError(format!("FTP: {e}"))
}

fn ftp_put(config: &FtpConfig, remote_dir: &str, local: &Path) -> Result<String> {
    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| MigrationError::NetworkError(format!("cannot resolve {}", config.host)))?;

    let mut ftp = FtpStream::connect_timeout(addr, config.connect_timeout).map_err(ftp_error)?;
    ftp.login(
        config.credentials.username.as_str(),
        config.credentials.password.as_str(),
    )
    .map_err(ftp_error)?;
    ftp.cwd(config.web_root.as_str()).map_err(ftp_error)?;

    match ftp.mkdir(remote_dir) {
        Ok(()) => debug!(remote_dir, "Created remote directory"),
        // The server rejects creating a directory that already exists.
        Err(FtpError::UnexpectedResponse(_)) => debug!(remote_dir, "Remote directory exists"),
        Err(e) => return Err(ftp_error(e)),
    }

    ftp.transfer_type(FileType::Binary).map_err(ftp_error)?;
    let remote_path = format!("{remote_dir}/{}", file_name(local)?);
    let mut file = std::fs::File::open(local)?;
    let bytes = ftp.put_file(remote_path.as_str(), &mut file).map_err(ftp_error)?;
    if let Err(e) = ftp.quit() {
        debug!(error = %e, "FTP QUIT failed after upload");
    }

    debug!(remote_path = %remote_path, bytes, "Uploaded over FTP");
    Ok(remote_path)
}

#[async_trait]
impl AttachmentStore for FtpStore {
    async fn store(&self, remote_dir: &str, local: &Path) -> Result<String> {
        let config = self.config.clone();
        let remote_dir = remote_dir.to_string();
        let local = local.to_path_buf();
        tokio::task::spawn_blocking(move || ftp_put(&config, &remote_dir, &local))
            .await
            .map_err(|e| MigrationError::NetworkError(format!("FTP task failed: {e}")))?
    }
}

/// Copies into a local directory, e.g. a mounted web root.
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl AttachmentStore for DirectoryStore {
    async fn store(&self, remote_dir: &str, local: &Path) -> Result<String> {
        let dir = self.root.join(remote_dir);
        tokio::fs::create_dir_all(&dir).await?;
        let name = file_name(local)?;
        tokio::fs::copy(local, dir.join(&name)).await?;
        Ok(format!("{remote_dir}/{name}"))
    }
}

enum Staging {
    Temporary(TempDir),
    Fixed(PathBuf),
}

impl Staging {
    fn path(&self) -> &Path {
        match self {
            Self::Temporary(dir) => dir.path(),
            Self::Fixed(path) => path,
        }
    }
}

/// Where re-hosted files end up: `{public_base}/{remote_root}/{comment_id}/{file}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RehostLayout {
    public_base: String,
    remote_root: String,
}

impl RehostLayout {
    /// Layout served from `public_base` with the default remote root.
    pub fn new(public_base: impl Into<String>) -> Self {
        Self {
            public_base: public_base.into().trim_end_matches('/').to_string(),
            remote_root: DEFAULT_REMOTE_ROOT.to_string(),
        }
    }

    /// Use a different directory under the store root.
    pub fn with_remote_root(mut self, remote_root: impl Into<String>) -> Self {
        self.remote_root = remote_root.into().trim_matches('/').to_string();
        self
    }

    /// Public base URL of the store.
    pub fn public_base(&self) -> &str {
        &self.public_base
    }

    /// Directory, relative to the store root, for a comment's files.
    pub fn remote_dir(&self, comment_id: i64) -> String {
        format!("{}/{comment_id}", self.remote_root)
    }

    /// Public URL of a stored path.
    pub fn url_of(&self, remote_path: &str) -> String {
        format!("{}/{}", self.public_base, remote_path.trim_start_matches('/'))
    }

    /// Where a comment's file named `display_name` is served from.
    ///
    /// `None` if the name has no usable file component.
    pub fn url(&self, comment_id: i64, display_name: &str) -> Option<String> {
        let name = clean_file_name(display_name)?;
        Some(self.url_of(&format!("{}/{name}", self.remote_dir(comment_id))))
    }
}

/// Copy of `comment` pointing at the location an earlier run uploaded to.
pub fn relocate(comment: &Comment, layout: &RehostLayout) -> Comment {
    let mut relocated = comment.clone();
    if let Some(attachment) = &comment.attachment {
        match layout.url(comment.id, &attachment.name) {
            Some(url) => relocated.attachment = Some(attachment.with_url(url)),
            None => warn!(
                comment_id = comment.id,
                name = %attachment.name,
                "Attachment name unusable, keeping legacy link"
            ),
        }
    }
    relocated
}

/// Moves attachments from the legacy tracker to a file store.
pub struct AttachmentTransfer {
    client: Client,
    store: Box<dyn AttachmentStore>,
    staging: Staging,
    layout: RehostLayout,
}

impl AttachmentTransfer {
    /// Create a transfer staging files in a fresh temporary directory.
    pub fn new(store: Box<dyn AttachmentStore>, layout: RehostLayout) -> Result<Self> {
        let client = Client::builder()
            .user_agent("bugport")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| MigrationError::NetworkError(e.to_string()))?;
        let staging = tempfile::Builder::new().prefix("bugport-").tempdir()?;

        Ok(Self {
            client,
            store,
            staging: Staging::Temporary(staging),
            layout,
        })
    }

    /// Stage downloads in `dir` instead, keeping them after the run.
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging = Staging::Fixed(dir.into());
        self
    }

    /// URL layout of the store.
    pub fn layout(&self) -> &RehostLayout {
        &self.layout
    }

    /// Download an attachment into the staging directory.
    ///
    /// The file is always written directly inside the staging directory,
    /// whatever path the scraped name carries.
    pub async fn download(&self, attachment: &Attachment) -> Result<PathBuf> {
        let name = attachment.clean_file_name().ok_or_else(|| {
            MigrationError::MarkupMismatch(format!("unusable attachment name {:?}", attachment.name))
        })?;
        let response = self
            .client
            .get(&attachment.url)
            .send()
            .await
            .map_err(|e| MigrationError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MigrationError::NetworkError(format!(
                "GET {} returned {}",
                attachment.url,
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| MigrationError::NetworkError(e.to_string()))?;

        tokio::fs::create_dir_all(self.staging.path()).await?;
        let path = self.staging.path().join(name);
        tokio::fs::write(&path, &bytes).await?;
        debug!(path = %path.display(), bytes = bytes.len(), "Downloaded attachment");
        Ok(path)
    }

    /// Upload a staged file for a comment, returning its public URL.
    pub async fn upload(&self, local: &Path, comment_id: i64) -> Result<String> {
        let remote_path = self
            .store
            .store(&self.layout.remote_dir(comment_id), local)
            .await?;
        Ok(self.layout.url_of(&remote_path))
    }

    /// Copy of `comment` whose attachment has been downloaded and uploaded.
    pub async fn rehost(&self, comment: &Comment) -> Result<Comment> {
        let Some(attachment) = &comment.attachment else {
            return Ok(comment.clone());
        };

        let failed = |e: MigrationError| MigrationError::TransferFailed {
            comment_id: comment.id,
            reason: e.to_string(),
        };
        let local = self.download(attachment).await.map_err(failed)?;
        let url = self.upload(&local, comment.id).await.map_err(failed)?;
        info!(comment_id = comment.id, url = %url, "Re-hosted attachment");

        let mut rehosted = comment.clone();
        rehosted.attachment = Some(attachment.with_url(url));
        Ok(rehosted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn comment(id: i64, url: &str) -> Comment {
        let date = NaiveDate::from_ymd_opt(2010, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        Comment::new(id, "hol353", date, "see file")
            .with_attachment(Attachment::new("met data.met", 11, url))
    }

    fn transfer(store_root: &Path, staging: &Path) -> AttachmentTransfer {
        AttachmentTransfer::new(
            Box::new(DirectoryStore::new(store_root)),
            RehostLayout::new("https://files.example.org/"),
        )
        .unwrap()
        .with_staging_dir(staging)
    }

    #[test]
    fn test_layout_urls() {
        let layout = RehostLayout::new("https://www.apsim.info/");
        assert_eq!(layout.remote_dir(7), "BugAttachments/7");
        assert_eq!(
            layout.url(7, "soil file.xml").as_deref(),
            Some("https://www.apsim.info/BugAttachments/7/soil_file.xml")
        );
        assert_eq!(
            layout.url(7, "../../etc/passwd").as_deref(),
            Some("https://www.apsim.info/BugAttachments/7/passwd")
        );
        assert_eq!(layout.url(7, ".."), None);

        let custom = layout.with_remote_root("/Files/");
        assert_eq!(custom.url(1, "a").as_deref(), Some("https://www.apsim.info/Files/1/a"));
    }

    #[test]
    fn test_relocate_points_at_store() {
        let layout = RehostLayout::new("https://files.example.org/");
        let legacy = comment(31, "https://old/view_attachment.aspx?id=31");
        let moved = relocate(&legacy, &layout);
        assert_eq!(
            moved.attachment.unwrap().url,
            "https://files.example.org/BugAttachments/31/met_data.met"
        );
        assert_eq!(
            legacy.attachment.unwrap().url,
            "https://old/view_attachment.aspx?id=31"
        );
    }

    #[tokio::test]
    async fn test_rehost_downloads_and_stores() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/BugTracker/view_attachment.aspx"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let store = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let transfer = AttachmentTransfer::new(
            Box::new(DirectoryStore::new(store.path())),
            RehostLayout::new("https://files.example.org").with_remote_root("/Files/"),
        )
        .unwrap()
        .with_staging_dir(staging.path());

        let legacy = comment(
            77,
            &format!("{}/BugTracker/view_attachment.aspx?id=77", server.uri()),
        );
        let rehosted = transfer.rehost(&legacy).await.unwrap();

        assert_eq!(
            rehosted.attachment.as_ref().unwrap().url,
            "https://files.example.org/Files/77/met_data.met"
        );
        assert_eq!(rehosted.text, legacy.text);
        assert!(staging.path().join("met_data.met").exists());
        let stored = std::fs::read(store.path().join("Files/77/met_data.met")).unwrap();
        assert_eq!(stored, b"hello world");
    }

    #[tokio::test]
    async fn test_rehost_existing_directory_is_fine() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
            .mount(&server)
            .await;

        let store = TempDir::new().unwrap();
        std::fs::create_dir_all(store.path().join("BugAttachments/5")).unwrap();
        let staging = TempDir::new().unwrap();
        let transfer = transfer(store.path(), staging.path());

        let rehosted = transfer
            .rehost(&comment(5, &format!("{}/a", server.uri())))
            .await;
        assert!(rehosted.is_ok());
    }

    #[tokio::test]
    async fn test_rehost_failure_names_comment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let transfer = transfer(store.path(), staging.path());

        let err = transfer
            .rehost(&comment(12, &format!("{}/missing", server.uri())))
            .await
            .unwrap_err();
        match err {
            MigrationError::TransferFailed { comment_id, .. } => assert_eq!(comment_id, 12),
            other => panic!("expected transfer failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_download_stays_inside_staging() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/view_attachment.aspx"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
            .mount(&server)
            .await;

        let root = TempDir::new().unwrap();
        let staging = root.path().join("staging");
        let transfer = transfer(&root.path().join("store"), &staging);
        let attachment = Attachment::new(
            "../escaped.txt",
            4,
            format!("{}/view_attachment.aspx?id=5", server.uri()),
        );

        let local = transfer.download(&attachment).await.unwrap();
        assert_eq!(local, staging.join("escaped.txt"));
        assert!(local.exists());
        assert!(!root.path().join("escaped.txt").exists());
    }

    #[tokio::test]
    async fn test_rehost_rejects_unusable_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
            .expect(0)
            .mount(&server)
            .await;

        let store = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let transfer = transfer(store.path(), staging.path());
        let date = NaiveDate::from_ymd_opt(2010, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let legacy = Comment::new(44, "hol353", date, "see file").with_attachment(
            Attachment::new("..", 4, format!("{}/view_attachment.aspx?id=44", server.uri())),
        );

        match transfer.rehost(&legacy).await {
            Err(MigrationError::TransferFailed { comment_id, .. }) => assert_eq!(comment_id, 44),
            other => panic!("expected TransferFailed, got {other:?}"),
        }
    }

    /// One-session FTP server that accepts a single upload and rejects QUIT.
    fn scripted_ftp_server() -> (u16, std::thread::JoinHandle<(Vec<String>, Vec<u8>)>) {
        use std::io::{BufRead, BufReader, Read, Write};
        use std::net::TcpListener;

        let control = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = control.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (stream, _) = control.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut commands = Vec::new();
            let mut received = Vec::new();
            let mut data = None;

            writer.write_all(b"220 ready\r\n").unwrap();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    break;
                }
                let line = line.trim_end().to_string();
                let verb = line.split(' ').next().unwrap_or_default().to_string();
                commands.push(line);
                let reply = match verb.as_str() {
                    "USER" => writer.write_all(b"331 password please\r\n"),
                    "PASS" => writer.write_all(b"230 logged in\r\n"),
                    "CWD" => writer.write_all(b"250 ok\r\n"),
                    "MKD" => writer.write_all(b"257 created\r\n"),
                    "TYPE" => writer.write_all(b"200 binary\r\n"),
                    "PASV" => {
                        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
                        let p = listener.local_addr().unwrap().port();
                        data = Some(listener);
                        writer.write_all(
                            format!("227 Entering Passive Mode (127,0,0,1,{},{})\r\n", p / 256, p % 256)
                                .as_bytes(),
                        )
                    }
                    "STOR" => {
                        writer.write_all(b"150 go ahead\r\n").unwrap();
                        let (mut conn, _) = data.take().unwrap().accept().unwrap();
                        conn.read_to_end(&mut received).unwrap();
                        writer.write_all(b"226 done\r\n")
                    }
                    "QUIT" => {
                        writer.write_all(b"500 not today\r\n").unwrap();
                        break;
                    }
                    _ => writer.write_all(b"502 unsupported\r\n"),
                };
                reply.unwrap();
            }
            (commands, received)
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_ftp_upload_survives_rejected_quit() {
        let (port, server) = scripted_ftp_server();
        let staging = TempDir::new().unwrap();
        let local = staging.path().join("notes.txt");
        std::fs::write(&local, b"ftp bytes").unwrap();

        let credentials = FtpCredentials {
            username: "apsim".into(),
            password: "secret".into(),
        };
        let store = FtpStore::new(
            FtpConfig::new("127.0.0.1", credentials)
                .with_port(port)
                .with_web_root("www"),
        );
        let stored = store.store("BugAttachments/9", &local).await.unwrap();
        assert_eq!(stored, "BugAttachments/9/notes.txt");

        let (commands, received) = server.join().unwrap();
        assert_eq!(received, b"ftp bytes");
        assert!(commands.iter().any(|c| c == "CWD www"));
        assert!(commands.iter().any(|c| c == "MKD BugAttachments/9"));
        assert_eq!(commands.last().map(String::as_str), Some("QUIT"));
    }

    #[tokio::test]
    async fn test_rehost_without_attachment_is_identity() {
        let store = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let transfer = transfer(store.path(), staging.path());

        let mut plain = comment(1, "unused");
        plain.attachment = None;
        assert_eq!(transfer.rehost(&plain).await.unwrap(), plain);
    }
}
