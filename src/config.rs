use std::time::Duration;
use anyhow::bail;

use crate::packet::{HEADER_BYTES, MAX_PAYLOAD_BYTES};

pub struct RdtpConfig {
    /// This is the size of RDTP packets (header included) inside IP datagrams. RDTP does no
    ///  path MTU discovery, so this must be supported on all routes between peers. The default
    ///  assumes full Ethernet frames.
    pub max_packet_bytes: usize,

    /// Application data is cut into chunks of (at most) this size, each sent as a single packet
    pub chunk_size: usize,

    /// Time to wait for the peer's part of a handshake or teardown exchange
    pub handshake_timeout: Duration,

    /// Time after which an unacknowledged data packet is sent again
    pub ack_wait: Duration,
    /// Number of times a data packet is re-sent before the connection is considered broken
    pub max_retransmits: u32,

    /// Number of packets buffered per socket between the network receiver and the socket's
    ///  receive pump. A full queue blocks the network receiver.
    pub inbound_queue_capacity: usize,
    /// Number of pending connection notifications per listener
    pub listener_backlog: usize,

    /// Number of random local ports tried for an outgoing connection before giving up
    pub dial_port_attempts: usize,

    pub service_socket_path: String,
}

impl Default for RdtpConfig {
    fn default() -> Self {
        RdtpConfig {
            max_packet_bytes: crate::packet::MAX_PACKET_BYTES,
            chunk_size: MAX_PAYLOAD_BYTES,
            handshake_timeout: Duration::from_secs(1),
            ack_wait: Duration::from_secs(1),
            max_retransmits: 5,
            inbound_queue_capacity: 100,
            listener_backlog: 16,
            dial_port_attempts: 16,
            service_socket_path: "/var/run/rdtp.sock".to_string(),
        }
    }
}

impl RdtpConfig {
    pub fn max_payload_bytes(&self) -> usize {
        self.max_packet_bytes.saturating_sub(HEADER_BYTES)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_bytes <= HEADER_BYTES {
            bail!("packet size {} leaves no room for payload", self.max_packet_bytes);
        }
        if self.max_payload_bytes() > MAX_PAYLOAD_BYTES {
            bail!("packet size {} exceeds the wire format's limit of {} bytes", self.max_packet_bytes, crate::packet::MAX_PACKET_BYTES);
        }
        if self.chunk_size == 0 || self.chunk_size > self.max_payload_bytes() {
            bail!("chunk size must be between 1 and {}, was {}", self.max_payload_bytes(), self.chunk_size);
        }
        if self.inbound_queue_capacity == 0 {
            bail!("inbound queue capacity must be positive");
        }
        if self.listener_backlog == 0 {
            bail!("listener backlog must be positive");
        }
        if self.dial_port_attempts == 0 {
            bail!("at least one attempt is required to pick a local port");
        }
        if self.handshake_timeout.is_zero() || self.ack_wait.is_zero() {
            bail!("timeouts must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RdtpConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_payload_bytes(), 1483);
    }

    #[rstest]
    #[case::packet_too_small(|c: &mut RdtpConfig| c.max_packet_bytes = HEADER_BYTES)]
    #[case::packet_too_big(|c: &mut RdtpConfig| c.max_packet_bytes = 9000)]
    #[case::zero_chunk(|c: &mut RdtpConfig| c.chunk_size = 0)]
    #[case::chunk_exceeds_payload(|c: &mut RdtpConfig| { c.max_packet_bytes = 500; c.chunk_size = 484; })]
    #[case::zero_queue(|c: &mut RdtpConfig| c.inbound_queue_capacity = 0)]
    #[case::zero_backlog(|c: &mut RdtpConfig| c.listener_backlog = 0)]
    #[case::zero_attempts(|c: &mut RdtpConfig| c.dial_port_attempts = 0)]
    #[case::zero_timeout(|c: &mut RdtpConfig| c.handshake_timeout = Duration::ZERO)]
    fn test_invalid(#[case] modify: fn(&mut RdtpConfig)) {
        let mut config = RdtpConfig::default();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
