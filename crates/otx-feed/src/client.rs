//! HTTP client for the OTX subscribed-pulses endpoint.
//!
//! API key is passed in by the caller; never log it.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

use crate::model::Pulse;
use crate::PulseSource;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
const DEFAULT_MAX_PAGES: u32 = 1_000;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct OtxClient {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
    page_size: u32,
    max_pages: u32,
}

impl OtxClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(concat!("otx-connector/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build otx http client failed")?;
        Ok(Self {
            api_key: api_key.into(),
            http,
            base_url: base_url.into(),
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
        })
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Upper bound on `next` links followed in one fetch.
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    fn subscribed_url(&self) -> String {
        format!(
            "{}/api/v1/pulses/subscribed",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn get_page(&self, req: reqwest::RequestBuilder) -> Result<PulsePage> {
        let resp = req
            .header("X-OTX-API-KEY", self.api_key.as_str())
            .send()
            .await
            .context("otx request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "otx http error status={} body={}",
                status.as_u16(),
                truncate(&body, 200)
            ));
        }

        resp.json::<PulsePage>()
            .await
            .context("otx response json decode failed")
    }
}

#[async_trait::async_trait]
impl PulseSource for OtxClient {
    fn source_name(&self) -> &'static str {
        "otx"
    }

    async fn fetch_pulses_modified_since(&self, since: DateTime<Utc>) -> Result<Vec<Pulse>> {
        let since_s = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        let limit_s = self.page_size.to_string();

        tracing::info!(modified_since = %since_s, "fetching subscribed pulses");

        let first = self.http.get(self.subscribed_url()).query(&[
            ("modified_since", since_s.as_str()),
            ("limit", limit_s.as_str()),
            ("page", "1"),
        ]);
        let mut page = self.get_page(first).await?;
        let mut out = std::mem::take(&mut page.results);
        let mut pages = 1u32;

        while let Some(next) = page.next.take().filter(|n| !n.is_empty()) {
            if pages >= self.max_pages {
                bail!(
                    "otx pagination exceeded {} pages (modified_since={})",
                    self.max_pages,
                    since_s
                );
            }
            page = self.get_page(self.http.get(&next)).await?;
            out.append(&mut page.results);
            pages += 1;
        }

        tracing::info!(pulses = out.len(), pages, "fetched subscribed pulses");
        Ok(out)
    }
}

#[derive(Debug, Deserialize)]
struct PulsePage {
    #[serde(default)]
    results: Vec<Pulse>,
    #[serde(default)]
    next: Option<String>,
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
