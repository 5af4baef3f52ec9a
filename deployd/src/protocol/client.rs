//! HTTP transport to a remote execution agent

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use tracing::{debug, error};

use crate::errors::DeployError;
use crate::protocol::{ExecutionAgent, ExecutionRequest, Frame, FrameStream};

/// Path of the execution endpoint on the agent
pub const EXECUTIONS_PATH: &str = "/v1/executions";

/// Talks NDJSON to an agent's `/v1/executions` endpoint
///
/// There is no overall request timeout: a build may stream for
/// as long as the orchestrator's deployment deadline allows.
pub struct HttpAgentClient {
    client: Client,
    base_url: String,
}

impl HttpAgentClient {
    /// Create a new client for the agent at `base_url`
    pub fn new(base_url: &str) -> Result<Self, DeployError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ExecutionAgent for HttpAgentClient {
    async fn execute(&self, request: ExecutionRequest) -> Result<FrameStream, DeployError> {
        let url = format!("{}{}", self.base_url, EXECUTIONS_PATH);
        debug!("POST {} for {}", url, request.trace_id);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| DeployError::TransportError(format!("agent unreachable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Agent rejected execution: {} - {}", status, body);
            return Err(DeployError::TransportError(format!(
                "agent responded {}: {}",
                status,
                body.trim()
            )));
        }

        let bytes = response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| DeployError::TransportError(format!("stream interrupted: {}", e)))
        });
        Ok(decode_ndjson(bytes))
    }
}

struct Decoder<S> {
    inner: Pin<Box<S>>,
    buf: Vec<u8>,
    done: bool,
}

/// Split a byte stream into newline-delimited JSON frames
///
/// A trailing partial line at end of stream is decoded as a final frame.
/// Any error ends the stream after it is yielded.
pub fn decode_ndjson<S>(inner: S) -> FrameStream
where
    S: Stream<Item = Result<Bytes, DeployError>> + Send + 'static,
{
    let state = Decoder {
        inner: Box::pin(inner),
        buf: Vec::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.done {
                return None;
            }

            if let Some(pos) = state.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let frame = parse_line(line);
                if frame.is_err() {
                    state.done = true;
                }
                return Some((frame, state));
            }

            match state.inner.next().await {
                Some(Ok(bytes)) => state.buf.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.done = true;
                    if state.buf.iter().all(u8::is_ascii_whitespace) {
                        return None;
                    }
                    let rest = std::mem::take(&mut state.buf);
                    return Some((parse_line(&rest), state));
                }
            }
        }
    }))
}

fn parse_line(line: &[u8]) -> Result<Frame, DeployError> {
    serde_json::from_slice(line)
        .map_err(|e| DeployError::TransportError(format!("malformed frame: {}", e)))
}
