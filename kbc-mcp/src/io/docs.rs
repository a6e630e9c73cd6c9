//! Client for the Keboola AI service documentation endpoint.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::{GateError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Cap on the whole exchange, including writing the request body.
const TOTAL_TIMEOUT: Duration = Duration::from_secs(75);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Prefix that scopes free-text questions to CLI documentation.
pub const CLI_QUERY_PREFIX: &str = "Keboola CLI kbc command: ";

#[derive(Serialize)]
struct DocsQuestionRequest<'a> {
    query: &'a str,
}

/// Answer to a documentation question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocsAnswer {
    pub text: String,
    #[serde(rename(deserialize = "sourceUrls"), default)]
    pub source_urls: Vec<String>,
}

pub struct DocsClient {
    http: Client,
    base_url: String,
    token: String,
}

impl DocsClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build()
            .map_err(|err| GateError::DocsQuery(format!("build http client: {err}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/docs/question", self.base_url)
    }

    /// Ask a question answered from the Keboola documentation.
    #[instrument(skip_all)]
    pub async fn docs_question(&self, query: &str) -> Result<DocsAnswer> {
        debug!(endpoint = %self.endpoint(), "sending docs question");
        let response = self
            .http
            .post(self.endpoint())
            .header("Accept", "application/json")
            .header("X-StorageAPI-Token", &self.token)
            .json(&DocsQuestionRequest { query })
            .send()
            .await
            .map_err(|err| GateError::DocsQuery(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "docs question rejected");
            return Err(GateError::DocsQuery(format!("HTTP {status}: {}", body.trim())));
        }

        response
            .json::<DocsAnswer>()
            .await
            .map_err(|err| GateError::DocsQuery(format!("decode response: {err}")))
    }
}

/// Scope a free-text question to CLI documentation.
pub fn cli_query(query: &str) -> String {
    format!("{CLI_QUERY_PREFIX}{query}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_parses_camel_case_sources() {
        let answer: DocsAnswer = serde_json::from_str(
            r#"{"text": "Use kbc sync push.", "sourceUrls": ["https://help.keboola.com/cli/"]}"#,
        )
        .expect("parse");
        assert_eq!(answer.text, "Use kbc sync push.");
        assert_eq!(answer.source_urls, vec!["https://help.keboola.com/cli/"]);
    }

    #[test]
    fn answer_without_sources_defaults_to_empty() {
        let answer: DocsAnswer = serde_json::from_str(r#"{"text": "n/a"}"#).expect("parse");
        assert!(answer.source_urls.is_empty());
    }

    #[test]
    fn endpoint_trims_trailing_slash() {
        let client = DocsClient::new("https://ai.keboola.com/", "token").expect("client");
        assert_eq!(client.endpoint(), "https://ai.keboola.com/docs/question");
    }

    #[test]
    fn query_is_scoped_to_cli_docs() {
        assert_eq!(
            cli_query("how to push"),
            "Keboola CLI kbc command: how to push"
        );
    }
}
