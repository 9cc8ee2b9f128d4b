//! Slow tier: the shared remote `News` table, reached through its REST gateway.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::core::models::RemoteRecord;
use crate::errors::PanelError;

const REMOTE_TABLE: &str = "News";
const REMOTE_COLUMNS: &str = "url,summarizer,ai_key_info";
const REMOTE_TIMEOUT_SECS: u64 = 30;

#[async_trait]
pub trait RemoteSummarySource: Send + Sync {
    /// All rows whose `url` equals `url` exactly. An empty vector is a miss.
    async fn fetch(&self, url: &str) -> Result<Vec<RemoteRecord>, PanelError>;
}

/// PostgREST-style gateway (`/rest/v1/{table}`), authenticated by an anon key.
#[derive(Debug, Clone)]
pub struct RestSummarySource {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl RestSummarySource {
    /// # Errors
    ///
    /// Returns an error if `base_url` is not a valid URL or the HTTP client cannot be built.
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, PanelError> {
        let base_url = Url::parse(base_url.trim())
            .map_err(|e| PanelError::ConfigError(format!("remote url {base_url}: {e}")))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(REMOTE_TIMEOUT_SECS))
            .build()
            .map_err(|e| PanelError::HttpError(format!("Failed to build remote HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            api_key: api_key.into(),
        })
    }

    /// The request URL for one page lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL cannot carry a path.
    pub fn query_url(&self, page_url: &str) -> Result<Url, PanelError> {
        let mut endpoint = self.base_url.clone();
        endpoint
            .path_segments_mut()
            .map_err(|()| PanelError::ConfigError(format!("remote url {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(["rest", "v1", REMOTE_TABLE]);
        endpoint
            .query_pairs_mut()
            .append_pair("select", REMOTE_COLUMNS)
            .append_pair("url", &format!("eq.{page_url}"));
        Ok(endpoint)
    }
}

#[async_trait]
impl RemoteSummarySource for RestSummarySource {
    async fn fetch(&self, url: &str) -> Result<Vec<RemoteRecord>, PanelError> {
        let endpoint = self.query_url(url)?;
        debug!(url = %url, "Querying remote summaries");

        let response = self
            .http
            .get(endpoint)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| PanelError::RemoteError(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|e| {
                format!("Failed to read error response body (status {status}): {e}")
            });
            return Err(PanelError::RemoteError(format!(
                "status {status}: {error_text}"
            )));
        }

        let records: Vec<RemoteRecord> = response
            .json()
            .await
            .map_err(|e| PanelError::RemoteError(format!("unreadable response: {e}")))?;
        info!(url = %url, rows = records.len(), "Remote summary lookup finished");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_url_filters_by_exact_url() {
        let source = RestSummarySource::new("https://db.example.com", "anon").unwrap();
        let query = source.query_url("https://news.example.com/a?b=1").unwrap();

        assert_eq!(query.path(), "/rest/v1/News");
        let pairs: Vec<(String, String)> = query.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("select".to_string(), "url,summarizer,ai_key_info".to_string()),
                ("url".to_string(), "eq.https://news.example.com/a?b=1".to_string()),
            ]
        );
    }

    #[test]
    fn base_with_trailing_slash_does_not_double_up() {
        let source = RestSummarySource::new("https://db.example.com/", "anon").unwrap();
        assert_eq!(source.query_url("x").unwrap().path(), "/rest/v1/News");
    }

    #[test]
    fn invalid_base_is_a_config_error() {
        assert!(matches!(
            RestSummarySource::new("not a url", "anon"),
            Err(PanelError::ConfigError(_))
        ));
    }
}
