//! IPC protocol between the host bridge and the isolated evaluator.
//!
//! Uses length-delimited JSON messages: 4-byte big-endian length prefix + JSON payload.
//! Every payload is an object carrying a `type` discriminator; field names are
//! camelCase so the frames read the same as the structured messages a browser
//! sandbox would exchange.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default maximum IPC message size: 8 MB.
pub const DEFAULT_MAX_IPC_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Messages sent from the host into the isolated environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    /// Run a user script.
    #[serde(rename_all = "camelCase")]
    ExecuteScript {
        /// Correlation id, echoed back in `scriptResult` / `scriptError`.
        script_id: u64,
        /// User-authored script source (an async function body).
        code: String,
    },
    /// Outcome of a proxied network call.
    #[serde(rename_all = "camelCase")]
    FetchResponse {
        /// Matches the `requestId` of the originating `fetchRequest`.
        request_id: u64,
        /// Response body text (success only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        /// HTTP status code (success only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        /// Transport failure description (failure only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl HostMessage {
    /// Build the `fetchResponse` for a proxy outcome.
    pub fn fetch_response(
        request_id: u64,
        outcome: Result<FetchReply, crate::error::ProxyError>,
    ) -> Self {
        match outcome {
            Ok(reply) => Self::FetchResponse {
                request_id,
                body: Some(reply.body),
                status: Some(reply.status),
                error: None,
            },
            Err(e) => Self::FetchResponse {
                request_id,
                body: None,
                status: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Messages sent from the isolated environment to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SandboxMessage {
    /// The environment finished loading and accepts scripts.
    SandboxReady,
    /// A script returned normally.
    #[serde(rename_all = "camelCase")]
    ScriptResult {
        /// Correlation id of the `executeScript` message.
        #[serde(alias = "requestId")]
        script_id: u64,
        /// Whatever the script returned; sanitized by the host.
        #[serde(default)]
        result: Value,
    },
    /// A script threw or failed to compile.
    #[serde(rename_all = "camelCase")]
    ScriptError {
        /// Correlation id of the `executeScript` message.
        #[serde(alias = "requestId")]
        script_id: u64,
        /// Error description, if the evaluator had one.
        #[serde(default)]
        error: Option<String>,
    },
    /// A script called `fetchData`; the host must perform the request.
    #[serde(rename_all = "camelCase")]
    FetchRequest {
        /// Fetch-level correlation id, independent of the script id.
        request_id: u64,
        /// Target URL.
        url: String,
        /// Forwarded request options.
        #[serde(default)]
        options: Option<FetchOptions>,
    },
}

/// The subset of fetch options a script may set. Anything else is dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOptions {
    /// HTTP method; `GET` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Request headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    /// Request body text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// A completed proxied request. Any HTTP status counts as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReply {
    /// Response body as text.
    pub body: String,
    /// HTTP status code.
    pub status: u16,
}

/// Write a length-delimited JSON message to an async writer.
///
/// Format: 4-byte big-endian length prefix followed by the JSON payload bytes.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<(), std::io::Error> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "IPC payload too large: {} bytes (max {} bytes)",
                payload.len(),
                u32::MAX
            ),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-delimited JSON message from an async reader.
///
/// Returns `None` if the reader has reached EOF (clean shutdown).
/// Uses [`DEFAULT_MAX_IPC_MESSAGE_SIZE`] as the size limit.
pub async fn read_message<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<T>, std::io::Error> {
    read_message_with_limit(reader, DEFAULT_MAX_IPC_MESSAGE_SIZE).await
}

/// Read a length-delimited JSON message with a configurable size limit.
///
/// Returns `None` if the reader has reached EOF (clean shutdown).
pub async fn read_message_with_limit<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<T>, std::io::Error> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "IPC message too large: {} bytes (limit: {} bytes)",
                len, max_size
            ),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let msg: T = serde_json::from_slice(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(msg))
}

/// Interpret a raw frame as a typed message.
///
/// Frames without a `type`, with an unknown `type`, or with fields of the wrong
/// shape yield `None`; the receiving side ignores them.
pub fn decode_frame<T: for<'de> Deserialize<'de>>(frame: Value) -> Option<T> {
    if frame.get("type").and_then(Value::as_str).is_none() {
        return None;
    }
    serde_json::from_value(frame).ok()
}
