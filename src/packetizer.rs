use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::addr::RdtpAddr;
use crate::error::RdtpError;
use crate::network::PacketSink;
use crate::packet::flags::Flags;
use crate::packet::{Packet, MAX_PAYLOAD_BYTES};

/// Returned by [Packetizer::pack_and_forward] if forwarding stopped part-way: `sent` bytes
///  (all of them in chunks preceding the failed one) went to the sink before the failure.
#[derive(Debug, PartialEq, Eq)]
pub struct PartialForward {
    pub sent: usize,
    pub error: RdtpError,
}

impl Display for PartialForward {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (after forwarding {} bytes)", self.error, self.sent)
    }
}

impl std::error::Error for PartialForward {}

/// Cuts a byte stream into chunks, wrapping each in a packet for one connection's endpoints
///  and forwarding it to a sink.
///
/// Data packets are numbered from 1 upward; control packets carry sequence number 0 so that
///  acknowledgements of data can be told apart from handshake ACKs.
pub struct Packetizer {
    local: RdtpAddr,
    remote: RdtpAddr,
    max_chunk_size: usize,
    next_seq_no: AtomicU32,
    sink: Arc<dyn PacketSink>,
}

impl Packetizer {
    pub fn new(local: RdtpAddr, remote: RdtpAddr, max_chunk_size: usize, sink: Arc<dyn PacketSink>) -> Result<Packetizer, RdtpError> {
        if max_chunk_size > MAX_PAYLOAD_BYTES {
            return Err(RdtpError::ChunkSizeTooLarge(max_chunk_size));
        }
        if max_chunk_size == 0 {
            return Err(RdtpError::InvalidConfig("chunk size must be positive".to_string()));
        }

        Ok(Packetizer {
            local,
            remote,
            max_chunk_size,
            next_seq_no: AtomicU32::new(1),
            sink,
        })
    }

    pub fn local_addr(&self) -> RdtpAddr {
        self.local
    }

    pub fn remote_addr(&self) -> RdtpAddr {
        self.remote
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Sends `data` as a sequence of packets with at most `max_chunk_size` payload bytes each,
    ///  in order, stopping at the first chunk the sink rejects. Empty data produces no packets.
    pub async fn pack_and_forward(&self, data: Bytes) -> Result<usize, PartialForward> {
        let mut sent = 0;

        while sent < data.len() {
            let end = usize::min(sent + self.max_chunk_size, data.len());
            let chunk = data.slice(sent..end);
            let chunk_len = chunk.len();

            if let Err(e) = self.forward_chunk(chunk).await {
                return Err(PartialForward {
                    sent,
                    error: RdtpError::forward_failed(format!("chunk at offset {}", sent), e),
                });
            }
            sent += chunk_len;
        }

        Ok(sent)
    }

    async fn forward_chunk(&self, chunk: Bytes) -> Result<(), RdtpError> {
        let mut packet = Packet::new(self.local.port, self.remote.port, chunk)?;
        packet.seq_no = self.take_seq_no();
        trace!("forwarding data packet #{} with {} bytes to {}", packet.seq_no, packet.length, self.remote);

        self.finalize_and_forward(packet).await
    }

    /// Sends a zero-payload packet with exactly the given flags set
    pub async fn send_control(&self, syn: bool, ack: bool, fin: bool, err: bool) -> Result<(), RdtpError> {
        let flags = Flags::control(syn, ack, fin, err);
        self.send_control_packet(Packet::control(self.local.port, self.remote.port, flags)).await
    }

    /// Acknowledges the data packet with sequence number `seq_no`
    pub async fn send_data_ack(&self, seq_no: u32) -> Result<(), RdtpError> {
        let mut packet = Packet::control(self.local.port, self.remote.port, Flags::ACK);
        packet.ack_no = seq_no;
        self.send_control_packet(packet).await
    }

    async fn send_control_packet(&self, packet: Packet) -> Result<(), RdtpError> {
        trace!("sending control packet {} to {}", packet.flags, self.remote);
        let flags = packet.flags;

        self.finalize_and_forward(packet).await
            .map_err(|e| RdtpError::forward_failed(format!("control packet {}", flags), e))
    }

    async fn finalize_and_forward(&self, mut packet: Packet) -> Result<(), RdtpError> {
        packet.set_source_ip(self.local.host);
        packet.set_destination_ip(self.remote.host);
        packet.set_checksum();
        self.sink.send_packet(packet).await
    }

    fn take_seq_no(&self) -> u32 {
        loop {
            let seq_no = self.next_seq_no.fetch_add(1, Ordering::Relaxed);
            // 0 is reserved for control packets
            if seq_no != 0 {
                return seq_no;
            }
        }
    }
}
