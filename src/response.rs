use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;

/// Fully read HTTP response as seen by callers of the executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub status_code: u16,
    /// Header names are lowercased
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status_code: u16, headers: HashMap<String, String>, body: String) -> Self {
        let headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();

        Self {
            status_code,
            headers,
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }
}
