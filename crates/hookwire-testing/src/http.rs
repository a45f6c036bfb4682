//! HTTP mocking for listener endpoints.

use std::time::Duration;

use serde_json::Value;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer as WiremockServer, ResponseTemplate,
};

/// A request received by the mock server.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Request path.
    pub path: String,
    /// `Content-Type` header, if any.
    pub content_type: Option<String>,
    /// Raw body.
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// Parses the body as JSON.
    pub fn json(&self) -> anyhow::Result<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Mock listener endpoint server.
pub struct MockServer {
    server: WiremockServer,
}

impl MockServer {
    /// Starts a server on a random port.
    pub async fn start() -> Self {
        Self { server: WiremockServer::start().await }
    }

    /// Base URL of the server.
    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Full URL for `path`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server.uri())
    }

    /// Responds to every POST on `path` with `status`.
    pub async fn respond(&self, path_str: &str, status: u16) {
        Mock::given(method("POST"))
            .and(path(path_str))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Responds to POSTs on `path` with `statuses` in order, repeating the
    /// last one once the sequence is used up.
    pub async fn respond_sequence(&self, path_str: &str, statuses: &[u16]) {
        let Some((last, head)) = statuses.split_last() else {
            return;
        };
        for status in head {
            Mock::given(method("POST"))
                .and(path(path_str))
                .respond_with(ResponseTemplate::new(*status))
                .up_to_n_times(1)
                .mount(&self.server)
                .await;
        }
        self.respond(path_str, *last).await;
    }

    /// Responds on `path` after `delay`.
    pub async fn respond_slowly(&self, path_str: &str, delay: Duration) {
        Mock::given(method("POST"))
            .and(path(path_str))
            .respond_with(ResponseTemplate::new(200).set_delay(delay))
            .mount(&self.server)
            .await;
    }

    /// All requests received so far.
    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|request| RecordedRequest {
                path: request.url.path().to_string(),
                content_type: request
                    .headers
                    .get("content-type")
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string),
                body: request.body,
            })
            .collect()
    }

    /// Requests received on `path`.
    pub async fn requests_to(&self, path_str: &str) -> Vec<RecordedRequest> {
        self.requests().await.into_iter().filter(|r| r.path == path_str).collect()
    }

    /// Number of requests received on `path`.
    pub async fn request_count(&self, path_str: &str) -> usize {
        self.requests_to(path_str).await.len()
    }
}
