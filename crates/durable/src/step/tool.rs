//! Streaming tool gateway client
//!
//! Tool steps POST their resolved input to
//! `{gateway}/mcp/{connection_id}/stream/{tool_name}` and consume the
//! response as a newline-delimited JSON stream. Chunks are buffered into
//! `step_stream_chunks` as they arrive; on end-of-stream they coalesce into
//! the step output (a single chunk stays a value, several become an array)
//! and the buffer is dropped.

use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::StepError;
use crate::persistence::ExecutionStore;

/// Client for the tool gateway
#[derive(Debug, Clone)]
pub struct ToolGateway {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl ToolGateway {
    /// Create a gateway client
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StepError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StepError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        })
    }

    /// Invoke a tool, buffering stream chunks and returning the coalesced output
    ///
    /// A non-2xx status is a gateway error carrying the body text; transport
    /// failures (connect, timeout, broken stream) are retryable.
    #[instrument(skip(self, store, input), fields(%execution_id, step_id))]
    pub async fn call(
        &self,
        store: &dyn ExecutionStore,
        execution_id: Uuid,
        step_id: &str,
        connection_id: &str,
        tool_name: &str,
        input: &Value,
    ) -> Result<Value, StepError> {
        let url = format!("{}/mcp/{}/stream/{}", self.base_url, connection_id, tool_name);

        // A fresh attempt starts a fresh buffer
        store.clear_stream_chunks(execution_id, step_id).await?;

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(input)
            .send()
            .await
            .map_err(|e| StepError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StepError::Gateway {
                status: status.as_u16(),
                body,
            });
        }

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunks: Vec<Value> = Vec::new();

        while let Some(bytes) = stream.next().await {
            let bytes = bytes.map_err(|e| StepError::Transport(e.to_string()))?;
            buffer.extend_from_slice(&bytes);

            while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                push_chunk(store, execution_id, step_id, &line, &mut chunks).await?;
            }
        }

        // stream may end without a trailing newline
        let tail = std::mem::take(&mut buffer);
        push_chunk(store, execution_id, step_id, &tail, &mut chunks).await?;

        debug!(tool_name, chunk_count = chunks.len(), "tool stream finished");

        let output = match chunks.len() {
            0 => Value::Null,
            1 => chunks.pop().unwrap_or(Value::Null),
            _ => Value::Array(chunks),
        };

        store.clear_stream_chunks(execution_id, step_id).await?;
        Ok(output)
    }
}

async fn push_chunk(
    store: &dyn ExecutionStore,
    execution_id: Uuid,
    step_id: &str,
    raw: &[u8],
    chunks: &mut Vec<Value>,
) -> Result<(), StepError> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| StepError::Transport(format!("non-utf8 stream chunk: {e}")))?
        .trim();
    if text.is_empty() {
        return Ok(());
    }

    let value: Value = serde_json::from_str(text)
        .map_err(|e| StepError::Transport(format!("malformed stream chunk: {e}")))?;

    store
        .append_stream_chunk(execution_id, step_id, chunks.len() as u32, value.clone())
        .await?;
    chunks.push(value);
    Ok(())
}
