//! Bugport CLI - moves a legacy BugTracker.NET site into GitHub issues.

use anyhow::Context;
use bugport_migrate::{
    read_ftp_credentials, read_token, AttachmentFailurePolicy, AttachmentTransfer,
    ConsoleProgressReporter, FtpConfig, FtpStore, MigrationConfig, MigrationMode,
    MigrationOptions, MigrationProgress, Migrator, RehostLayout, DEFAULT_API_URL,
    DEFAULT_SOURCE_URL,
};
use clap::{ArgGroup, Parser};
use std::path::PathBuf;

mod logging;

use logging::LogFormat;

/// Bugport - migrate legacy bugs to GitHub issues
#[derive(Parser, Debug)]
#[command(name = "bugport")]
#[command(author, version, about, long_about = None)]
#[command(group(
    ArgGroup::new("mode")
        .args(["fix_links", "fix_links2", "close_issues", "fix_formatting"])
        .multiple(false)
))]
struct Cli {
    /// Only report warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Maximum number of bugs to process; zero or less processes all
    #[arg(short = 'n', value_name = "COUNT", default_value_t = 0, allow_negative_numbers = true)]
    max: i64,

    /// Root URL of the legacy bug tracker
    #[arg(short, long, default_value = DEFAULT_SOURCE_URL)]
    url: String,

    /// Download attachments and upload them to the file store
    #[arg(long)]
    reupload: bool,

    /// Add the missing scheme to attachment links
    #[arg(long)]
    fix_links: bool,

    /// Point links into the legacy tracker at re-hosted attachments
    #[arg(long = "fix-links2")]
    fix_links2: bool,

    /// Close issues whose legacy bug is closed
    #[arg(long)]
    close_issues: bool,

    /// Strip tab characters from issues and comments
    #[arg(long)]
    fix_formatting: bool,

    /// Owner of the target repository
    #[arg(long, default_value = "APSIMInitiative")]
    owner: String,

    /// Name of the target repository
    #[arg(long, default_value = "APSIMClassic")]
    repo: String,

    /// File holding the GitHub access token
    #[arg(long, default_value = "secret.txt")]
    token_file: PathBuf,

    /// File holding `username=` and `password=` lines for the FTP server
    #[arg(long, default_value = "credentials.txt")]
    ftp_credentials: PathBuf,

    /// FTP server hosting re-uploaded attachments
    #[arg(long, default_value = "www.apsim.info")]
    ftp_host: String,

    /// FTP control port
    #[arg(long, default_value_t = 21)]
    ftp_port: u16,

    /// Directory on the FTP server that is served publicly
    #[arg(long, default_value = "APSIM")]
    ftp_root: String,

    /// Public URL of the FTP web root (default: https://<ftp-host>)
    #[arg(long)]
    attachment_base_url: Option<String>,

    /// Skip bugs with an id at or below this one
    #[arg(long, value_name = "ID")]
    resume_after: Option<i64>,

    /// Skip bugs whose attachments cannot be transferred instead of stopping
    #[arg(long)]
    skip_failed_attachments: bool,

    /// GitHub API base URL
    #[arg(long, default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl Cli {
    fn mode(&self) -> MigrationMode {
        if self.fix_links {
            MigrationMode::FixLinks
        } else if self.fix_links2 {
            MigrationMode::FixLinksV2
        } else if self.close_issues {
            MigrationMode::CloseIssues
        } else if self.fix_formatting {
            MigrationMode::FixFormatting
        } else {
            MigrationMode::Transfer
        }
    }

    fn options(&self) -> MigrationOptions {
        let policy = if self.skip_failed_attachments {
            AttachmentFailurePolicy::Skip
        } else {
            AttachmentFailurePolicy::Abort
        };
        let options = MigrationOptions::default()
            .with_mode(self.mode())
            .with_max_bugs(self.max)
            .with_reupload(self.reupload)
            .with_attachment_failure(policy);
        match self.resume_after {
            Some(id) => options.with_resume_after(id),
            None => options,
        }
    }

    fn layout(&self) -> RehostLayout {
        let base = self
            .attachment_base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}", self.ftp_host));
        RehostLayout::new(base)
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let token = read_token(&cli.token_file)
        .with_context(|| format!("reading token from {}", cli.token_file.display()))?;
    let config = MigrationConfig::new(&cli.url, format!("{}/{}", cli.owner, cli.repo))
        .with_token(token)
        .with_api_url(&cli.api_url);
    let layout = cli.layout();

    let reporter = if cli.quiet {
        ConsoleProgressReporter::hidden()
    } else {
        ConsoleProgressReporter::new()
    };
    let progress = MigrationProgress::with_callback(reporter.callback());

    let mut migrator = Migrator::new(config, cli.options(), layout.clone())?.with_progress(progress);

    if cli.reupload {
        let credentials = read_ftp_credentials(&cli.ftp_credentials).with_context(|| {
            format!("reading FTP credentials from {}", cli.ftp_credentials.display())
        })?;
        let ftp = FtpConfig::new(&cli.ftp_host, credentials)
            .with_port(cli.ftp_port)
            .with_web_root(&cli.ftp_root);
        let transfer = AttachmentTransfer::new(Box::new(FtpStore::new(ftp)), layout)?;
        migrator = migrator.with_transfer(transfer);
    }

    let result = migrator.run().await;
    reporter.finish(if result.is_ok() { "Finished" } else { "Failed" });

    let report = result?;
    if !cli.quiet {
        report.print_summary();
    }
    if !report.is_successful() {
        anyhow::bail!("migration finished with errors");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(logging::level(cli.quiet, cli.verbose), cli.log_format);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
