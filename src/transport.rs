//! Outgoing requests and the network seam the executor calls through.

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Client, Method, Url};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result, TransportError};
use crate::response::ApiResponse;

/// One logical call: what to send plus how hard to try.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub json_body: Option<serde_json::Value>,
    pub query_params: Vec<(String, String)>,
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Deadline for the whole call, sleeps included
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            json_body: None,
            query_params: Vec::new(),
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.json_body = Some(body);
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.push((name.into(), value.into()));
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Rejects requests no attempt could ever send.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.url)
            .map_err(|e| Error::InvalidRequest(format!("invalid URL '{}': {}", self.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidRequest(format!(
                "unsupported URL scheme '{}'",
                url.scheme()
            )));
        }

        for (name, value) in &self.headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::InvalidRequest(format!("invalid header name '{}'", name)))?;
            HeaderValue::from_str(value)
                .map_err(|_| Error::InvalidRequest(format!("invalid value for header '{}'", name)))?;
        }

        Ok(())
    }
}

/// Performs a single HTTP attempt. Retrying is the executor's job.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> std::result::Result<ApiResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// `request_timeout` bounds each attempt.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> std::result::Result<ApiResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .query(&request.query_params);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.json_body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(transport_error)?;

        debug!(method = %request.method, url = %request.url, status, "HTTP attempt completed");
        Ok(ApiResponse::new(status, headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let request = ApiRequest::get("https://api.close.com/api/v1/me/");
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.max_retries, 3);
        assert_eq!(request.initial_delay, Duration::from_secs(1));
        assert!(request.timeout.is_none());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        assert!(matches!(
            ApiRequest::get("not a url").validate(),
            Err(Error::InvalidRequest(_))
        ));
        assert!(ApiRequest::get("ftp://api.close.com/x").validate().is_err());
        assert!(ApiRequest::get("https://api.close.com/")
            .header("bad header", "x")
            .validate()
            .is_err());
        assert!(ApiRequest::get("https://api.close.com/")
            .header("x-ok", "line\nbreak")
            .validate()
            .is_err());
    }
}
