//! HTTP page fetcher for the NVD CVE API.
//!
//! [`PageFetcher`] performs exactly one request per call: it shapes the URL
//! and credential header for the schema in use, enforces the response size
//! ceiling, and maps every failure onto [`FetchError`]. Retrying and pacing
//! belong to the pipeline and the governor.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::{Client, Url};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::HarvestConfig;
use crate::harvest::traits::{format_for, SchemaFormat};
use crate::model::{HarvestCursor, RawPage, SchemaVersion};
use crate::traits::{FetchError, PageSource};

/// Issues authenticated page requests against the configured endpoint.
#[derive(Debug, Clone)]
pub struct PageFetcher {
    client: Client,
    config: Arc<HarvestConfig>,
}

impl PageFetcher {
    /// Builds the HTTP client from the run configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidRequest`] if the client cannot be built
    /// (e.g. the user agent is not a valid header value).
    pub fn new(config: Arc<HarvestConfig>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| FetchError::InvalidRequest(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Full request URL for the page `cursor` points at.
    pub fn page_url(
        &self,
        cursor: &HarvestCursor,
        format: &dyn SchemaFormat,
    ) -> Result<Url, FetchError> {
        let mut url = Url::parse(self.config.base_url()).map_err(|e| {
            FetchError::InvalidRequest(format!("Invalid base URL '{}': {}", self.config.base_url(), e))
        })?;
        format.apply_query(&mut url, cursor, &self.config);
        Ok(url)
    }

    fn classify_transport(&self, error: reqwest::Error) -> FetchError {
        if error.is_timeout() {
            FetchError::Timeout(self.config.request_timeout())
        } else if error.is_builder() {
            FetchError::InvalidRequest(error.to_string())
        } else {
            FetchError::Transport(error.to_string())
        }
    }

    async fn read_body(&self, mut response: reqwest::Response) -> Result<Vec<u8>, FetchError> {
        let limit = self.config.max_response_bytes;
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(FetchError::ResponseTooLarge { limit });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| self.classify_transport(e))?
        {
            if body.len() as u64 + chunk.len() as u64 > limit {
                return Err(FetchError::ResponseTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl PageSource for PageFetcher {
    #[instrument(skip(self, cursor), fields(offset = cursor.offset, page_size = cursor.page_size))]
    async fn fetch(
        &self,
        cursor: &HarvestCursor,
        schema: SchemaVersion,
    ) -> Result<RawPage, FetchError> {
        let format = format_for(schema);
        let url = self.page_url(cursor, format)?;
        debug!(url = %url, "Fetching page");

        let mut request = self.client.get(url).header(ACCEPT, "application/json");
        if let Some(key) = &self.config.api_key {
            let (name, value) = format.auth_header(key);
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "Page request rejected");
            return Err(FetchError::from_status(
                status.as_u16(),
                parse_retry_after(response.headers()),
            ));
        }

        let body = self.read_body(response).await?;
        format
            .decode_page(&body)
            .map_err(|e| FetchError::MalformedResponse(e.to_string()))
    }
}

/// `Retry-After` in its delay-seconds form.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
