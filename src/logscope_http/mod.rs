//! HTTP client for the log backend's REST and SSE endpoints.

pub mod sse;

use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::logscope_core::{decode_entries, LogEntry, Page, PageRequest, StreamItem, TransportError};
use crate::logscope_session::LogSource;
use sse::{SseDecoder, SseEvent};

const LOGS_PATH: &str = "api/logs";
const STREAM_PATH: &str = "api/v1/logs/stream";
const VALIDATE_PATH: &str = "api/v1/validate_query";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
pub struct HttpLogSource {
    client: Client,
    base: String,
    token: Option<String>,
    /// Minutes west of UTC; the backend reads date literals in queries in
    /// this zone.
    tz_offset: i32,
}

impl HttpLogSource {
    pub fn new(address: &Url, token: Option<String>) -> Result<Self, TransportError> {
        let client = Client::builder().build()?;
        Ok(Self::with_client(client, address, token))
    }

    pub fn with_client(client: Client, address: &Url, token: Option<String>) -> Self {
        let base = address.as_str().trim_end_matches('/').to_string();
        let token = token.filter(|token| !token.trim().is_empty());
        Self { client, base, token, tz_offset: local_tz_offset() }
    }

    pub fn with_tz_offset(mut self, minutes_west: i32) -> Self {
        self.tz_offset = minutes_west;
        self
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn tz_offset(&self) -> i32 {
        self.tz_offset
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let request = self.client.get(format!("{}/{path}", self.base));
        match &self.token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }
}

impl LogSource for HttpLogSource {
    async fn fetch_page(&self, request: PageRequest) -> Result<Page, TransportError> {
        let mut params = vec![
            ("query", request.query),
            ("count", request.limit.to_string()),
            ("tzOffset", self.tz_offset.to_string()),
        ];
        if let Some(before) = &request.before {
            params.push(("endDate", before.to_string()));
        }
        let response = ensure_success(self.get(LOGS_PATH).query(&params).send().await?).await?;
        let body = response.bytes().await?;
        let values: Vec<Value> = serde_json::from_slice(&body)?;
        let (entries, malformed) = decode_entries(values);
        debug!(entries = entries.len(), malformed, "page received");
        Ok(Page { entries, malformed })
    }

    async fn stream(&self, query: String, sink: mpsc::Sender<StreamItem>) -> Result<(), TransportError> {
        let params = [("query", query), ("tzOffset", self.tz_offset.to_string())];
        let request = self.get(STREAM_PATH).query(&params).header(ACCEPT, "text/event-stream");
        let mut response = ensure_success(request.send().await?).await?;
        let mut decoder = SseDecoder::new();
        while let Some(chunk) = response.chunk().await? {
            for event in decoder.feed(&chunk) {
                if !forward(&sink, event).await {
                    return Ok(());
                }
            }
        }
        if let Some(event) = decoder.finish() {
            forward(&sink, event).await;
        }
        Ok(())
    }

    async fn validate_query(&self, query: String) -> Result<Option<String>, TransportError> {
        let response = self.get(VALIDATE_PATH).query(&[("query", query)]).send().await?;
        if response.status().is_success() {
            return Ok(None);
        }
        if response.status() == StatusCode::BAD_REQUEST {
            let body = response.text().await?;
            return Ok(Some(error_message(body)));
        }
        Err(status_error(response).await)
    }
}

fn local_tz_offset() -> i32 {
    -chrono::Local::now().offset().local_minus_utc() / 60
}

/// Sends one decoded event; `false` once the receiver is gone.
async fn forward(sink: &mpsc::Sender<StreamItem>, event: SseEvent) -> bool {
    let item = match LogEntry::from_json(&event.data) {
        Ok(entry) => StreamItem::Entry(entry),
        Err(error) => {
            debug!(%error, "dropping malformed stream entry");
            StreamItem::Malformed
        }
    };
    sink.send(item).await.is_ok()
}

async fn ensure_success(response: Response) -> Result<Response, TransportError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(status_error(response).await)
    }
}

async fn status_error(response: Response) -> TransportError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    TransportError::Status { status, body: error_message(body) }
}

/// Prefers the backend's `{"error": ...}` message over the raw body.
fn error_message(body: String) -> String {
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => parsed.error,
        Err(_) => body.trim().to_string(),
    }
}
