//! Confluence REST API client and the destination service trait.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, Response};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::{Rejection, is_success_status};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Reference to a page that exists on the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageHandle {
    pub id: String,
    pub title: String,
    pub url: String,
}

/// Read/write access to the destination wiki.
pub trait DestinationApi {
    fn page_exists(&mut self, space: &str, title: &str) -> Result<bool>;
    fn get_page_id(&mut self, space: &str, title: &str) -> Result<Option<String>>;
    /// Create a page from wiki markup. A refused write comes back as the
    /// destination's own [`Rejection`], transport failures included.
    fn create_page(
        &mut self,
        space: &str,
        parent_id: Option<&str>,
        title: &str,
        body: &str,
    ) -> std::result::Result<PageHandle, Rejection>;
    fn attach_file(&mut self, page_id: &str, filename: &str, content: Vec<u8>) -> Result<()>;
    fn add_comment(&mut self, page_id: &str, body: &str) -> Result<()>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct ConfluenceClientConfig {
    pub server: String,
    pub user: String,
    pub password: String,
    pub user_agent: String,
    pub timeout_ms: u64,
}

impl ConfluenceClientConfig {
    pub fn new(server: &str, user: &str, password: &str, user_agent: &str) -> Self {
        Self {
            server: server.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
            user_agent: user_agent.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

pub struct ConfluenceClient {
    client: Client,
    config: ConfluenceClientConfig,
    request_count: usize,
}

impl ConfluenceClient {
    pub fn new(config: ConfluenceClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Confluence HTTP client")?;
        Ok(Self {
            client,
            config,
            request_count: 0,
        })
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        let raw = format!("{}/rest/api/{}", self.config.server, path.trim_start_matches('/'));
        Url::parse(&raw).with_context(|| format!("invalid Confluence URL: {raw}"))
    }

    fn find_page(&mut self, space: &str, title: &str) -> Result<Option<ContentItem>> {
        let mut url = self.api_url("content")?;
        url.query_pairs_mut()
            .append_pair("spaceKey", space)
            .append_pair("title", title)
            .append_pair("type", "page");
        self.request_count += 1;
        let response = self
            .client
            .get(url)
            .header("User-Agent", self.config.user_agent.clone())
            .header("Accept", "application/json")
            .basic_auth(&self.config.user, Some(&self.config.password))
            .send()
            .context("failed to call Confluence API")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("Confluence page lookup for {space}/{title} failed with HTTP {status}: {body}");
        }
        let parsed: ContentSearchResponse = response
            .json()
            .context("failed to decode Confluence content search response")?;
        Ok(parsed.results.into_iter().next())
    }

    fn page_url(&self, item: &ContentItem) -> String {
        match item.links.as_ref().and_then(|links| links.webui.as_deref()) {
            Some(webui) => {
                let base = item
                    .links
                    .as_ref()
                    .and_then(|links| links.base.as_deref())
                    .unwrap_or(&self.config.server);
                format!("{base}{webui}")
            }
            None => format!(
                "{}/pages/viewpage.action?pageId={}",
                self.config.server, item.id
            ),
        }
    }

    fn post_json(&mut self, url: Url, payload: &Value) -> Result<Response> {
        self.request_count += 1;
        self.client
            .post(url)
            .header("User-Agent", self.config.user_agent.clone())
            .header("Accept", "application/json")
            .basic_auth(&self.config.user, Some(&self.config.password))
            .json(payload)
            .send()
            .context("failed to call Confluence API")
    }
}

impl DestinationApi for ConfluenceClient {
    fn page_exists(&mut self, space: &str, title: &str) -> Result<bool> {
        Ok(self.find_page(space, title)?.is_some())
    }

    fn get_page_id(&mut self, space: &str, title: &str) -> Result<Option<String>> {
        Ok(self.find_page(space, title)?.map(|item| item.id))
    }

    fn create_page(
        &mut self,
        space: &str,
        parent_id: Option<&str>,
        title: &str,
        body: &str,
    ) -> std::result::Result<PageHandle, Rejection> {
        let url = self
            .api_url("content")
            .map_err(|error| Rejection::transport(error.to_string()))?;
        let mut payload = json!({
            "type": "page",
            "title": title,
            "space": {"key": space},
            "body": {
                "wiki": {
                    "value": body,
                    "representation": "wiki"
                }
            }
        });
        if let Some(parent_id) = parent_id {
            payload["ancestors"] = json!([{"id": parent_id}]);
        }

        debug!("creating Confluence page {space}/{title}");
        let response = self
            .post_json(url, &payload)
            .map_err(|error| Rejection::transport(format!("{error:#}")))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .map_err(|error| Rejection::transport(error.to_string()))?;

        if !is_success_status(Some(status)) {
            let mut rejection = serde_json::from_str::<Rejection>(&text)
                .unwrap_or_else(|_| Rejection::new(status, text.clone(), ""));
            if rejection.status_code == 0 {
                rejection.status_code = status;
            }
            return Err(rejection);
        }

        let item: ContentItem = serde_json::from_str(&text).map_err(|error| {
            Rejection::new(status, format!("unreadable create response: {error}"), "")
        })?;
        let handle = PageHandle {
            url: self.page_url(&item),
            id: item.id,
            title: item.title,
        };
        info!("created Confluence page {} ({})", handle.title, handle.id);
        Ok(handle)
    }

    fn attach_file(&mut self, page_id: &str, filename: &str, content: Vec<u8>) -> Result<()> {
        let url = self.api_url(&format!("content/{page_id}/child/attachment"))?;
        let form = Form::new().part("file", Part::bytes(content).file_name(filename.to_string()));
        self.request_count += 1;
        let response = self
            .client
            .post(url)
            .header("User-Agent", self.config.user_agent.clone())
            .header("X-Atlassian-Token", "nocheck")
            .basic_auth(&self.config.user, Some(&self.config.password))
            .multipart(form)
            .send()
            .context("failed to call Confluence API")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("attaching {filename} to page {page_id} failed with HTTP {status}: {body}");
        }
        Ok(())
    }

    fn add_comment(&mut self, page_id: &str, body: &str) -> Result<()> {
        let url = self.api_url("content")?;
        let payload = json!({
            "type": "comment",
            "container": {"id": page_id, "type": "page"},
            "body": {
                "wiki": {
                    "value": body,
                    "representation": "wiki"
                }
            }
        });
        let response = self.post_json(url, &payload)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            bail!("adding comment to page {page_id} failed with HTTP {status}: {text}");
        }
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

#[derive(Debug, Deserialize, Default)]
struct ContentSearchResponse {
    #[serde(default)]
    results: Vec<ContentItem>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    id: String,
    title: String,
    #[serde(rename = "_links")]
    links: Option<ContentLinks>,
}

#[derive(Debug, Deserialize)]
struct ContentLinks {
    base: Option<String>,
    webui: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ConfluenceClient {
        ConfluenceClient::new(ConfluenceClientConfig::new(
            "https://confluence.example.org/",
            "bot",
            "secret",
            "test",
        ))
        .expect("client")
    }

    #[test]
    fn page_url_prefers_webui_link() {
        let item: ContentItem = serde_json::from_value(json!({
            "id": "42",
            "title": "Setup Guide",
            "_links": {"base": "https://wiki.example.org", "webui": "/display/DOC/Setup+Guide"}
        }))
        .expect("parse");
        assert_eq!(
            client().page_url(&item),
            "https://wiki.example.org/display/DOC/Setup+Guide"
        );
    }

    #[test]
    fn page_url_falls_back_to_page_id() {
        let item: ContentItem =
            serde_json::from_value(json!({"id": "42", "title": "Setup Guide"})).expect("parse");
        assert_eq!(
            client().page_url(&item),
            "https://confluence.example.org/pages/viewpage.action?pageId=42"
        );
    }

    #[test]
    fn search_response_reads_first_result() {
        let parsed: ContentSearchResponse = serde_json::from_value(json!({
            "results": [{"id": "7", "title": "Home"}],
            "size": 1
        }))
        .expect("parse");
        assert_eq!(parsed.results[0].id, "7");
    }

    #[test]
    fn api_url_joins_paths() {
        let url = client().api_url("/content/7/child/attachment").expect("url");
        assert_eq!(
            url.as_str(),
            "https://confluence.example.org/rest/api/content/7/child/attachment"
        );
    }
}
