use std::time::Duration;

use chrono::Utc;
use reqwest::Client;

use super::{parse_records, FetchError, Fetcher, Snapshot};

/// HTTP source returning a JSON snapshot document.
pub struct HttpFetcher {
    source_id: String,
    url: String,
    client: Client,
}

impl HttpFetcher {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            client: Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, timeout: Duration) -> Result<Snapshot, FetchError> {
        let request = async {
            let response = self
                .client
                .get(&self.url)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| classify(e, timeout))?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::SourceUnavailable(format!(
                    "{} returned HTTP {}",
                    self.url, status
                )));
            }

            response.text().await.map_err(|e| classify(e, timeout))
        };

        // The body must be complete before anything is parsed.
        let body = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| FetchError::Timeout(timeout))??;

        let records = parse_records(&body)?;
        Ok(Snapshot::new(self.source_id.clone(), Utc::now(), records))
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(timeout)
    } else if err.is_decode() || err.is_body() {
        FetchError::InvalidResponse(err.to_string())
    } else {
        FetchError::SourceUnavailable(err.to_string())
    }
}
