use crate::packet::flags::Flags;

/// Error kinds of the transport engine.
///
/// Codec and routing errors are handled where they occur (the packet is dropped and the
///  event logged), handshake and retransmission errors tear down the affected connection,
///  and registry conflicts are reported to whoever requested the resource.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RdtpError {
    #[error("malformed header: {0} bytes is less than the {min} byte header", min = crate::packet::HEADER_BYTES)]
    MalformedHeader(usize),
    #[error("length mismatch: header announces {announced} payload bytes, {available} available")]
    LengthMismatch { announced: u16, available: usize },
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("payload of {0} bytes exceeds the maximum of {max} bytes", max = crate::packet::MAX_PAYLOAD_BYTES)]
    PayloadTooLarge(usize),
    #[error("chunk size {0} exceeds the maximum payload of {max} bytes", max = crate::packet::MAX_PAYLOAD_BYTES)]
    ChunkSizeTooLarge(usize),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("no {0} IP address set on packet")]
    MissingAddress(&'static str),
    #[error("socket address {0} already in use")]
    AddressInUse(String),
    #[error("port {0} is in use")]
    PortInUse(u16),
    #[error("expected packet with flags {expected} but got {received}")]
    UnexpectedPacket { expected: Flags, received: Flags },
    #[error("operation timed out")]
    OperationTimedOut,
    #[error("could not forward packet {context}: {reason}")]
    ForwardFailed { context: String, reason: String },
    #[error("socket address {0} not active")]
    SocketNotActive(String),
    #[error("no listener on port {0}")]
    NoListener(u16),
    #[error("listener on port {0} cannot take notifications")]
    ListenerUnavailable(u16),
    #[error("packet {0} was not acknowledged after the maximum number of retransmissions")]
    RetransmitExhausted(u32),
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("socket {0} is not in a state to run")]
    NotEstablished(String),
    #[error("connection task failed: {0}")]
    TaskFailed(String),
}

impl RdtpError {
    pub fn forward_failed(context: impl Into<String>, reason: impl std::fmt::Display) -> RdtpError {
        RdtpError::ForwardFailed {
            context: context.into(),
            reason: reason.to_string(),
        }
    }
}
