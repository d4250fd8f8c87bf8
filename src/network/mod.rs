pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::{debug, info, warn};

use crate::error::RdtpError;
use crate::multiplexer::Multiplexer;
use crate::packet::Packet;

/// This is the abstraction for handing a finished packet (checksum and network addresses set)
///  to the network, introduced to decouple the protocol logic from raw IP I/O and to facilitate
///  mocking it away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketSink: Send + Sync + 'static {
    async fn send_packet(&self, packet: Packet) -> Result<(), RdtpError>;
}

/// The network boundary: an unreliable channel for RDTP packets. Implementations strip the IP
///  header, filter for [crate::packet::IP_PROTO_RDTP] and decode the RDTP part, and stamp the
///  source and destination IP addresses on received packets.
#[async_trait]
pub trait Network: PacketSink {
    /// Returns the next packet, or `None` once the network is shut down. Errors are per-datagram,
    ///  i.e. the caller may keep receiving after an error.
    async fn recv_packet(&self) -> anyhow::Result<Option<Packet>>;
}

/// The dedicated receive task: reads packets from the network and routes each of them through
///  the multiplexer. Packets that cannot be routed are logged and dropped - a single bad or
///  unexpected packet never stops the loop.
pub async fn run_receiver<N: Network + ?Sized>(network: Arc<N>, multiplexer: Arc<Multiplexer>) {
    info!("starting network receive loop");

    loop {
        let packet = match network.recv_packet().await {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                info!("network closed, stopping receive loop");
                return;
            }
            Err(e) => {
                warn!("could not receive packet from network: {}", e);
                continue;
            }
        };

        if let Err(e) = multiplexer.deliver(packet).await {
            debug!("dropping inbound packet: {}", e);
        }
    }
}
