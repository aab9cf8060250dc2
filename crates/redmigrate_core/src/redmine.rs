use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

/// Redmine reads use a fixed connect/read timeout.
const READ_TIMEOUT_MS: u64 = 10_000;
const MAX_RETRIES: usize = 2;
const RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiPage {
    pub title: String,
    pub text: String,
    pub version: u32,
    pub author: String,
    pub comments: String,
    pub created_on: String,
    pub updated_on: String,
    pub parent: Option<String>,
    pub attachments: Vec<WikiAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiAttachment {
    pub filename: String,
    pub content_url: String,
}

/// Entry of the project wiki index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiPageSummary {
    pub title: String,
    pub parent: Option<String>,
}

/// Read/write access to the source wiki.
pub trait SourceApi {
    /// `Ok(None)` when the page does not exist or the server could not be
    /// reached; callers treat both as "not found".
    fn get_wiki_page(&mut self, project: &str, title: &str, version: Option<u32>)
    -> Result<Option<WikiPage>>;
    fn list_wiki_pages(&mut self, project: &str) -> Result<Vec<WikiPageSummary>>;
    fn update_wiki_page(&mut self, project: &str, title: &str, text: &str, comment: &str)
    -> Result<()>;
    fn download_attachment(&mut self, content_url: &str) -> Result<Vec<u8>>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct RedmineClientConfig {
    pub server: String,
    pub api_key: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl RedmineClientConfig {
    pub fn new(server: &str, api_key: &str, user_agent: &str) -> Self {
        Self {
            server: server.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            user_agent: user_agent.to_string(),
            timeout_ms: READ_TIMEOUT_MS,
            max_retries: MAX_RETRIES,
            retry_delay_ms: RETRY_DELAY_MS,
        }
    }
}

pub struct RedmineClient {
    client: Client,
    config: RedmineClientConfig,
    request_count: usize,
}

impl RedmineClient {
    pub fn new(config: RedmineClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Redmine HTTP client")?;
        Ok(Self {
            client,
            config,
            request_count: 0,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.config.server)
            .with_context(|| format!("invalid Redmine server URL: {}", self.config.server))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Redmine server URL cannot be a base: {}", self.config.server))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// GET a JSON document. `Ok(None)` on 404 and on connectivity failures
    /// that survive the retry budget.
    fn get_json(&mut self, url: Url) -> Result<Option<Value>> {
        for attempt in 0..=self.config.max_retries {
            self.request_count += 1;
            let response = self
                .client
                .get(url.clone())
                .header("User-Agent", self.config.user_agent.clone())
                .header("X-Redmine-API-Key", self.config.api_key.clone())
                .header("Content-Type", "application/json")
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("Redmine request {url} failed with HTTP {status}");
                    }
                    let payload: Value = response
                        .json()
                        .context("failed to decode Redmine JSON response")?;
                    return Ok(Some(payload));
                }
                Err(error) => {
                    if !is_connectivity_error(&error) {
                        return Err(error).context("failed to call Redmine API");
                    }
                    if attempt < self.config.max_retries {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    warn!("connection error while contacting the Redmine server: {error}");
                    return Ok(None);
                }
            }
        }

        bail!("Redmine request exhausted retry budget")
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        sleep(Duration::from_millis(
            self.config
                .retry_delay_ms
                .saturating_mul(2u64.saturating_pow(exponent)),
        ));
    }
}

impl SourceApi for RedmineClient {
    fn get_wiki_page(
        &mut self,
        project: &str,
        title: &str,
        version: Option<u32>,
    ) -> Result<Option<WikiPage>> {
        let mut url = match version {
            Some(version) => {
                let version_segment = format!("{version}.json");
                self.url(&["projects", project, "wiki", title, &version_segment])?
            }
            None => {
                let title_segment = format!("{title}.json");
                self.url(&["projects", project, "wiki", &title_segment])?
            }
        };
        url.query_pairs_mut().append_pair("include", "attachments");

        debug!("fetching Redmine wiki page {project}:{title}");
        let Some(payload) = self.get_json(url)? else {
            return Ok(None);
        };
        let parsed: WikiPageResponse =
            serde_json::from_value(payload).context("failed to decode Redmine wiki page")?;
        Ok(Some(parsed.wiki_page.into()))
    }

    fn list_wiki_pages(&mut self, project: &str) -> Result<Vec<WikiPageSummary>> {
        let url = self.url(&["projects", project, "wiki", "index.json"])?;
        let payload = self
            .get_json(url)?
            .ok_or_else(|| anyhow::anyhow!("could not list wiki pages of Redmine project {project}"))?;
        let parsed: WikiIndexResponse =
            serde_json::from_value(payload).context("failed to decode Redmine wiki index")?;
        Ok(parsed
            .wiki_pages
            .into_iter()
            .map(|item| WikiPageSummary {
                title: item.title,
                parent: item.parent.map(|parent| parent.title),
            })
            .collect())
    }

    fn update_wiki_page(&mut self, project: &str, title: &str, text: &str, comment: &str) -> Result<()> {
        let title_segment = format!("{title}.json");
        let url = self.url(&["projects", project, "wiki", &title_segment])?;
        self.request_count += 1;
        let response = self
            .client
            .put(url)
            .header("User-Agent", self.config.user_agent.clone())
            .header("X-Redmine-API-Key", self.config.api_key.clone())
            .json(&json!({ "wiki_page": { "text": text, "comments": comment } }))
            .send()
            .context("failed to call Redmine API")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("Redmine wiki update for {title} failed with HTTP {status}: {body}");
        }
        Ok(())
    }

    fn download_attachment(&mut self, content_url: &str) -> Result<Vec<u8>> {
        self.request_count += 1;
        let response = self
            .client
            .get(content_url)
            .header("User-Agent", self.config.user_agent.clone())
            .header("X-Redmine-API-Key", self.config.api_key.clone())
            .send()
            .with_context(|| format!("failed to download {content_url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("attachment download {content_url} failed with HTTP {status}");
        }
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read attachment body from {content_url}"))?;
        Ok(bytes.to_vec())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Timeouts and refused connections are retried, then read as "not found".
fn is_connectivity_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

#[derive(Debug, Deserialize)]
struct WikiPageResponse {
    wiki_page: WikiPageItem,
}

#[derive(Debug, Deserialize)]
struct WikiPageItem {
    title: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    version: u32,
    author: Option<NamedItem>,
    #[serde(default)]
    comments: Option<String>,
    #[serde(default)]
    created_on: String,
    #[serde(default)]
    updated_on: String,
    parent: Option<TitleItem>,
    #[serde(default)]
    attachments: Vec<AttachmentItem>,
}

impl From<WikiPageItem> for WikiPage {
    fn from(item: WikiPageItem) -> Self {
        Self {
            title: item.title,
            text: item.text,
            version: item.version,
            author: item.author.map(|author| author.name).unwrap_or_default(),
            comments: item.comments.unwrap_or_default(),
            created_on: item.created_on,
            updated_on: item.updated_on,
            parent: item.parent.map(|parent| parent.title),
            attachments: item
                .attachments
                .into_iter()
                .map(|attachment| WikiAttachment {
                    filename: attachment.filename,
                    content_url: attachment.content_url,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WikiIndexResponse {
    #[serde(default)]
    wiki_pages: Vec<WikiIndexItem>,
}

#[derive(Debug, Deserialize)]
struct WikiIndexItem {
    title: String,
    parent: Option<TitleItem>,
}

#[derive(Debug, Deserialize)]
struct TitleItem {
    title: String,
}

#[derive(Debug, Deserialize)]
struct NamedItem {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AttachmentItem {
    filename: String,
    content_url: String,
}
