//! Messages of the local IPC protocol between applications and the RDTP service.
//!
//! Every message is a JSON document preceded by its length as a big-endian `u32`. After a
//!  successful `DIAL` or `ACCEPT` the service answers `OK`, and from then on the same stream
//!  carries the connection's raw application data.

use std::fmt::{Display, Formatter};

use anyhow::bail;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::addr::RdtpAddr;

/// Upper bound for a message's encoded length - messages are small, anything beyond this is
///  not a client speaking the protocol
pub const MAX_MESSAGE_BYTES: u32 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClientMessageType {
    /// Connect to `remote_addr` from a local port chosen by the service
    Dial,
    /// Listen for connection requests on `local_addr`'s port
    Listen,
    /// Accept a connection request from `remote_addr` to `local_addr`
    Accept,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: ClientMessageType,
    #[serde(default)]
    pub local_addr: RdtpAddr,
    #[serde(default)]
    pub remote_addr: RdtpAddr,
}

impl ClientMessage {
    pub fn new(kind: ClientMessageType, local_addr: RdtpAddr, remote_addr: RdtpAddr) -> ClientMessage {
        ClientMessage { kind, local_addr, remote_addr }
    }

    /// Distinguishes a syntactically valid message with an unknown type from a malformed one
    pub fn decode(buf: &[u8]) -> Result<ClientMessage, ServiceError> {
        let value: serde_json::Value = serde_json::from_slice(buf)
            .map_err(|_| ServiceError::MalformedMessage)?;

        match value.get("type").and_then(|t| t.as_str()) {
            Some("DIAL" | "LISTEN" | "ACCEPT") => {}
            Some(_) => return Err(ServiceError::InvalidMessageType),
            None => return Err(ServiceError::MalformedMessage),
        }

        serde_json::from_value(value)
            .map_err(|_| ServiceError::MalformedMessage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceMessageType {
    Ok,
    /// A connection request arrived for a listener, `remote_addr` is the requesting endpoint
    Notify,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceError {
    #[error("connection closed by client")]
    ConnClosedByClient,
    #[error("malformed message")]
    MalformedMessage,
    #[error("invalid message type")]
    InvalidMessageType,
    #[error("failed to create socket")]
    CreateSocketFail,
    #[error("failed to attach socket")]
    AttachSocketFail,
    #[error("failed to attach listener")]
    AttachListenerFail,
    #[error("handshake failed")]
    HandshakeFailed,
    #[error("communication with client failed")]
    CommunicationFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMessage {
    #[serde(rename = "type")]
    pub kind: ServiceMessageType,
    #[serde(default)]
    pub local_addr: RdtpAddr,
    #[serde(default)]
    pub remote_addr: RdtpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceError>,
}

impl ServiceMessage {
    pub fn ok(local_addr: RdtpAddr, remote_addr: RdtpAddr) -> ServiceMessage {
        ServiceMessage {
            kind: ServiceMessageType::Ok,
            local_addr,
            remote_addr,
            error: None,
        }
    }

    pub fn notify(local_addr: RdtpAddr, remote_addr: RdtpAddr) -> ServiceMessage {
        ServiceMessage {
            kind: ServiceMessageType::Notify,
            local_addr,
            remote_addr,
            error: None,
        }
    }

    pub fn error(error: ServiceError) -> ServiceMessage {
        ServiceMessage {
            kind: ServiceMessageType::Error,
            local_addr: RdtpAddr::default(),
            remote_addr: RdtpAddr::default(),
            error: Some(error),
        }
    }
}

impl Display for ServiceMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.error {
            Some(error) => write!(f, "{:?}({})", self.kind, error),
            None => write!(f, "{:?}[{} {}]", self.kind, self.local_addr, self.remote_addr),
        }
    }
}

/// Reads one length-prefixed message body. Returns `None` if the stream ends cleanly before
///  the length prefix, and fails with [std::io::ErrorKind::UnexpectedEof] if it ends anywhere
///  inside a frame.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> anyhow::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if stream.read(&mut len_buf[..1]).await? == 0 {
        return Ok(None);
    }
    stream.read_exact(&mut len_buf[1..]).await?;

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_BYTES {
        bail!("message of {} bytes exceeds the maximum of {} bytes", len, MAX_MESSAGE_BYTES);
    }

    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub async fn write_message<W, M>(stream: &mut W, message: &M) -> anyhow::Result<()>
where W: AsyncWrite + Unpin, M: Serialize
{
    let body = serde_json::to_vec(message)?;
    let len: u32 = body.len().try_into()?;

    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads and decodes one service message, for the client side of the protocol
pub async fn read_service_message<R: AsyncRead + Unpin>(stream: &mut R) -> anyhow::Result<Option<ServiceMessage>> {
    match read_frame(stream).await? {
        Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
        None => Ok(None),
    }
}
