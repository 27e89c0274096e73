//! HTTP transport for the chat completions endpoint

use std::{pin::Pin, time::Duration};

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::Stream;

use crate::{
    config::RelayConfig,
    error::{Error, Result},
    types::ChatRequest,
};

/// Raw response body chunks, in arrival order
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Issues completion requests. Dropping a returned [`ByteStream`] must close
/// the underlying connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a non-streaming request and return the first choice's content
    async fn complete(&self, config: &RelayConfig, request: &ChatRequest) -> Result<String>;

    /// Send a streaming request and return the response body
    async fn open_stream(&self, config: &RelayConfig, request: &ChatRequest) -> Result<ByteStream>;
}

/// Default connect timeout for [`HttpTransport::new`]
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// `reqwest`-backed transport
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with a default client
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Create a transport around a preconfigured client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn post(&self, config: &RelayConfig, request: &ChatRequest) -> Result<reqwest::Response> {
        let url = config.completions_url();
        tracing::debug!(
            "POST {} (model: {}, messages: {}, stream: {})",
            url,
            request.model,
            request.messages.len(),
            request.stream
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&config.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("Completion request failed with {}", status);
            return Err(Error::status(status.as_u16(), &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn complete(&self, config: &RelayConfig, request: &ChatRequest) -> Result<String> {
        let response = self.post(config, request).await?;
        let body = response.text().await?;
        let parsed: CompletionResponse = serde_json::from_str(&body)?;
        if let Some(err) = parsed.error {
            return Err(api_error(err));
        }
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                Error::UnexpectedResponse("response has no choices[0].message.content".to_string())
            })
    }

    async fn open_stream(&self, config: &RelayConfig, request: &ChatRequest) -> Result<ByteStream> {
        let response = self.post(config, request).await?;
        let mut body = response.bytes_stream();

        Ok(Box::pin(stream! {
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => yield Ok(bytes.to_vec()),
                    Err(e) => {
                        yield Err(Error::Stream(e.to_string()));
                        return;
                    }
                }
            }
        }))
    }
}

fn api_error(value: serde_json::Value) -> Error {
    match value {
        serde_json::Value::String(message) => Error::api("error", message),
        serde_json::Value::Object(map) => {
            let field = |key: &str| map.get(key).and_then(|v| v.as_str()).map(str::to_string);
            Error::api(
                field("type").unwrap_or_else(|| "error".to_string()),
                field("message")
                    .unwrap_or_else(|| serde_json::Value::Object(map.clone()).to_string()),
            )
        }
        other => Error::api("error", other.to_string()),
    }
}

// Non-streaming response shape

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    /// Some OpenAI-compatible servers report failures with a 2xx status
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}
