//! GitHub REST implementation of [`IssueTracker`].

use crate::error::{MigrationError, Result};
use crate::tracker::{
    IssuePage, IssueState, IssueTracker, IssueUpdate, Metered, RemoteComment, RemoteIssue,
};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, LINK};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Phrases GitHub uses when it blocks content creation for a while.
const ABUSE_MARKERS: [&str; 2] = ["abuse detection mechanism", "secondary rate limit"];

/// Wait assumed when a rate-limited response carries no reset time.
const DEFAULT_RESET_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
struct GitHubIssue {
    number: u64,
    title: String,
    body: Option<String>,
    state: IssueState,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

impl From<GitHubIssue> for RemoteIssue {
    fn from(issue: GitHubIssue) -> Self {
        Self {
            number: issue.number,
            title: issue.title,
            body: issue.body,
            state: issue.state,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitHubError {
    message: String,
}

#[derive(Debug, Serialize)]
struct CreateIssueRequest<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct CommentRequest<'a> {
    body: &'a str,
}

/// Client for one GitHub repository's issues.
pub struct GitHubClient {
    client: Client,
    api_url: String,
    owner: String,
    repo: String,
    token: Option<String>,
}

impl GitHubClient {
    /// Create a client for `owner/repo` on the API at `api_url`.
    pub fn new(
        api_url: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent("bugport")
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| MigrationError::NetworkError(e.to_string()))?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            owner: owner.into(),
            repo: repo.into(),
            token,
        })
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}{path}", self.api_url, self.owner, self.repo)
    }

    /// Send a request, turning failures into classified errors.
    async fn execute(&self, mut request: RequestBuilder) -> Result<(Response, u64)> {
        request = request.header("Accept", "application/vnd.github.v3+json");
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| MigrationError::NetworkError(e.to_string()))?;

        let headers = response.headers();
        let remaining = header_u64(headers, "x-ratelimit-remaining").unwrap_or(u64::MAX);
        let reset = header_u64(headers, "x-ratelimit-reset");

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, remaining, reset, &body));
        }
        Ok((response, remaining))
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Metered<T>> {
        let (response, remaining) = self.execute(request).await?;
        let data = response
            .json()
            .await
            .map_err(|e| MigrationError::ApiError(e.to_string()))?;
        Ok(Metered::new(data, remaining))
    }
}

#[async_trait]
impl IssueTracker for GitHubClient {
    async fn create_issue(&self, title: &str, body: &str) -> Result<Metered<RemoteIssue>> {
        let request = self
            .client
            .post(self.repo_url("/issues"))
            .json(&CreateIssueRequest { title, body });
        let issue: Metered<GitHubIssue> = self.json(request).await?;
        Ok(Metered::new(issue.data.into(), issue.remaining))
    }

    async fn create_comment(&self, issue: u64, body: &str) -> Result<Metered<RemoteComment>> {
        let request = self
            .client
            .post(self.repo_url(&format!("/issues/{issue}/comments")))
            .json(&CommentRequest { body });
        self.json(request).await
    }

    async fn update_issue(&self, issue: u64, update: &IssueUpdate) -> Result<Metered<RemoteIssue>> {
        let request = self
            .client
            .patch(self.repo_url(&format!("/issues/{issue}")))
            .json(update);
        let issue: Metered<GitHubIssue> = self.json(request).await?;
        Ok(Metered::new(issue.data.into(), issue.remaining))
    }

    async fn update_comment(&self, comment: u64, body: &str) -> Result<Metered<RemoteComment>> {
        let request = self
            .client
            .patch(self.repo_url(&format!("/issues/comments/{comment}")))
            .json(&CommentRequest { body });
        self.json(request).await
    }

    async fn list_issues(&self, cursor: Option<&str>) -> Result<Metered<IssuePage>> {
        let url = match cursor {
            Some(next) => next.to_string(),
            None => self.repo_url("/issues?state=all&per_page=100"),
        };
        let (response, remaining) = self.execute(self.client.get(&url)).await?;
        let next = next_link(response.headers());
        let issues: Vec<GitHubIssue> = response
            .json()
            .await
            .map_err(|e| MigrationError::ApiError(e.to_string()))?;

        let issues = issues
            .into_iter()
            .filter(|issue| issue.pull_request.is_none())
            .map(RemoteIssue::from)
            .collect();
        Ok(Metered::new(IssuePage { issues, next }, remaining))
    }

    async fn list_comments(&self, issue: u64) -> Result<Metered<Vec<RemoteComment>>> {
        let mut url = self.repo_url(&format!("/issues/{issue}/comments?per_page=100"));
        let mut comments = Vec::new();
        loop {
            let (response, remaining) = self.execute(self.client.get(&url)).await?;
            let next = next_link(response.headers());
            let page: Vec<RemoteComment> = response
                .json()
                .await
                .map_err(|e| MigrationError::ApiError(e.to_string()))?;
            comments.extend(page);

            match next {
                Some(next) => url = next,
                None => return Ok(Metered::new(comments, remaining)),
            }
        }
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Extract the `rel="next"` target of a `Link` header.
pub fn next_link(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim().trim_start_matches('<').trim_end_matches('>');
        pieces
            .any(|param| param.trim() == "rel=\"next\"")
            .then(|| target.to_string())
    })
}

/// Map a failed response onto the error taxonomy.
pub fn classify_failure(
    status: StatusCode,
    remaining: u64,
    reset: Option<u64>,
    body: &str,
) -> MigrationError {
    let message = serde_json::from_str::<GitHubError>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| body.to_string());
    debug!(%status, remaining, message = %message, "GitHub request failed");

    let throttled = status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS;
    if throttled && ABUSE_MARKERS.iter().any(|marker| message.contains(marker)) {
        return MigrationError::AbuseDetected(message);
    }
    if throttled && remaining == 0 {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let wait = reset
            .filter(|&reset| reset > now)
            .map(|reset| reset - now)
            .unwrap_or(DEFAULT_RESET_SECS);
        return MigrationError::RateLimitExceeded(wait);
    }
    match status {
        StatusCode::UNAUTHORIZED => MigrationError::AuthenticationFailed(message),
        StatusCode::FORBIDDEN => MigrationError::AuthenticationFailed(format!(
            "Access denied. Check your token permissions. ({message})"
        )),
        _ => MigrationError::ApiError(format!("GitHub API error ({status}): {message}")),
    }
}
