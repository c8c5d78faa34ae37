use crate::models::ChatTurn;
use crate::stream::{consume_body, StreamError, StreamHandler, StreamOutcome};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Path of the streaming endpoint, relative to the configured base URL.
pub const STREAM_PATH: &str = "/api/chat/stream";

// Trait defining the interface for chat backends
#[async_trait]
pub trait ChatStreamClient: Send + Sync {
    /// Sends `history` and feeds the streamed reply into `handler` until the
    /// backend finishes or `cancel` fires.
    async fn stream_chat_completion(
        &self,
        history: &[ChatTurn],
        cancel: &CancellationToken,
        handler: &mut dyn StreamHandler,
    ) -> Result<StreamOutcome, StreamError>;
}

/// Optional sampling knobs forwarded to the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationOptions {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
}

#[derive(Serialize, Debug)]
struct ChatRequestBody<'a> {
    messages: &'a [ChatTurn],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

/// Talks to the NDJSON streaming endpoint over HTTP.
#[derive(Debug, Clone)]
pub struct HttpStreamClient {
    client: Client,
    base_url: String,
    options: GenerationOptions,
}

impl HttpStreamClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            options: GenerationOptions::default(),
        }
    }

    pub fn options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, STREAM_PATH)
    }

    async fn send(&self, history: &[ChatTurn]) -> Result<reqwest::Response, StreamError> {
        let request_url = self.endpoint();
        log::info!(
            "Sending stream request to {} with {} messages",
            request_url,
            history.len()
        );

        let request_body = ChatRequestBody {
            messages: history,
            temperature: self.options.temperature,
            top_p: self.options.top_p,
        };

        let response = self
            .client
            .post(&request_url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                log::error!("Failed to send stream request: {:?}", e);
                StreamError::Transport(e.to_string())
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_default();
            log::error!("Stream request failed with status {}: {}", status, error_body);
            let message = if error_body.trim().is_empty() {
                format!("Request failed ({})", status.as_u16())
            } else {
                error_body
            };
            return Err(StreamError::Request {
                status: Some(status.as_u16()),
                message,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatStreamClient for HttpStreamClient {
    async fn stream_chat_completion(
        &self,
        history: &[ChatTurn],
        cancel: &CancellationToken,
        handler: &mut dyn StreamHandler,
    ) -> Result<StreamOutcome, StreamError> {
        // Cancellation also aborts a request still waiting on response headers
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::info!("Stream cancelled before the response arrived");
                return Ok(StreamOutcome::Cancelled);
            }
            response = self.send(history) => response?,
        };

        consume_body(response.bytes_stream(), cancel, handler).await
    }
}
