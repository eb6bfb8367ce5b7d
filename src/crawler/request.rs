use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Description of one page fetch
///
/// Requests without a body are sent as GET, requests with a JSON body as
/// POST. A stream's saved position is the request for its next page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub url: Url,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl PageRequest {
    pub fn get(url: Url) -> Self {
        Self { url, body: None }
    }

    pub fn post(url: Url, body: Value) -> Self {
        Self {
            url,
            body: Some(body),
        }
    }

    /// Returns a copy of this request pointing at a different URL
    pub fn with_url(&self, url: Url) -> Self {
        Self {
            url,
            body: self.body.clone(),
        }
    }

    pub fn method(&self) -> &'static str {
        if self.body.is_some() {
            "POST"
        } else {
            "GET"
        }
    }
}
