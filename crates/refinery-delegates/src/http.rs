use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use refinery_core::error::{DelegateError, RefineryError, Result};
use refinery_core::traits::AgentDelegate;
use refinery_core::types::{StageRequest, StageValue};

/// Delegate backed by an agent service.
///
/// `POST {base_url}/invoke` takes the `StageRequest` as JSON and answers
/// `{"output": <value>}`. `GET {base_url}/health` answers 2xx when the
/// service can accept work.
pub struct HttpDelegate {
    name: String,
    base_url: String,
    api_key: Option<String>,
    http: Client,
}

#[derive(Deserialize)]
struct InvokeResponse {
    output: StageValue,
}

impl HttpDelegate {
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        api_key: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| RefineryError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

impl AgentDelegate for HttpDelegate {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, request: StageRequest) -> BoxFuture<'_, std::result::Result<StageValue, DelegateError>> {
        Box::pin(async move {
            let timeout = request.timeout;
            let mut req = self.http.post(self.url("invoke")).timeout(timeout).json(&request);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            debug!(url = %self.base_url, stage = %request.stage, "Invoking agent service");
            let resp = req
                .send()
                .await
                .map_err(|e| classify_transport(&e, timeout))?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(classify_status(status, &body));
            }

            let body: InvokeResponse = resp
                .json()
                .await
                .map_err(|e| DelegateError::InvalidOutput(format!("bad response body: {}", e)))?;
            Ok(body.output)
        })
    }

    fn health(&self) -> BoxFuture<'_, std::result::Result<(), DelegateError>> {
        Box::pin(async move {
            let resp = self
                .http
                .get(self.url("health"))
                .timeout(Duration::from_secs(10))
                .send()
                .await
                .map_err(|e| DelegateError::Unavailable(format!("{}: {}", self.base_url, e)))?;
            let status = resp.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(DelegateError::Unavailable(format!(
                    "{} health returned {}",
                    self.base_url, status
                )))
            }
        })
    }
}

/// Map a non-success invoke status to a delegate error.
pub fn classify_status(status: StatusCode, body: &str) -> DelegateError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, truncate(body, 300))
    };
    match status.as_u16() {
        429 => DelegateError::RateLimited(detail),
        408 | 500..=599 => DelegateError::Connection(detail),
        _ => DelegateError::Rejected(detail),
    }
}

/// Map a reqwest transport failure to a delegate error.
fn classify_transport(e: &reqwest::Error, timeout: Duration) -> DelegateError {
    if e.is_timeout() {
        DelegateError::Timeout(timeout.as_millis() as u64)
    } else if e.is_decode() {
        DelegateError::InvalidOutput(e.to_string())
    } else {
        DelegateError::Connection(e.to_string())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
