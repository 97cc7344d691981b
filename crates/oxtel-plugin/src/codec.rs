//! Length-prefixed framing and content-type negotiation for the plugin
//! RPC channel.

use crate::error::{PluginError, Result};
use crate::proto::{CONTENT_TYPE_JSON, CONTENT_TYPE_MSGPACK};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are treated as a protocol violation.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireCodec {
    Msgpack,
    Json,
}

impl WireCodec {
    pub fn content_type(&self) -> &'static str {
        match self {
            WireCodec::Msgpack => CONTENT_TYPE_MSGPACK,
            WireCodec::Json => CONTENT_TYPE_JSON,
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            WireCodec::Msgpack => {
                rmp_serde::to_vec_named(value).map_err(|e| PluginError::Codec(e.to_string()))
            }
            WireCodec::Json => {
                serde_json::to_vec(value).map_err(|e| PluginError::Codec(e.to_string()))
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            WireCodec::Msgpack => {
                rmp_serde::from_slice(bytes).map_err(|e| PluginError::Codec(e.to_string()))
            }
            WireCodec::Json => {
                serde_json::from_slice(bytes).map_err(|e| PluginError::Codec(e.to_string()))
            }
        }
    }
}

/// Pick the first content type the daemon supports from the plugin's
/// declared list. An empty list means the plugin predates negotiation and
/// speaks MessagePack.
pub fn negotiate(content_types: &[String]) -> Result<WireCodec> {
    if content_types.is_empty() {
        return Ok(WireCodec::Msgpack);
    }
    for ct in content_types {
        match ct.as_str() {
            CONTENT_TYPE_MSGPACK => return Ok(WireCodec::Msgpack),
            CONTENT_TYPE_JSON => return Ok(WireCodec::Json),
            _ => continue,
        }
    }
    Err(PluginError::ContentType(content_types.to_vec()))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(PluginError::Codec(format!(
            "frame of {} bytes exceeds maximum",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(PluginError::Codec(format!(
            "frame of {len} bytes exceeds maximum"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}
