use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RdtpError;
use crate::network::PacketSink;
use crate::packet::Packet;

/// Records every packet it is given. Can be configured to reject packets after a number of
///  successful sends.
#[derive(Default)]
pub struct CollectingSink {
    packets: Mutex<Vec<Packet>>,
    fail_after: Option<usize>,
}

impl CollectingSink {
    pub fn failing_after(num_successful: usize) -> CollectingSink {
        CollectingSink {
            packets: Default::default(),
            fail_after: Some(num_successful),
        }
    }

    pub fn packets(&self) -> Vec<Packet> {
        self.packets.lock().unwrap().clone()
    }
}

#[async_trait]
impl PacketSink for CollectingSink {
    async fn send_packet(&self, packet: Packet) -> Result<(), RdtpError> {
        let mut packets = self.packets.lock().unwrap();
        if let Some(limit) = self.fail_after {
            if packets.len() >= limit {
                return Err(RdtpError::forward_failed("test sink", "sink is full"));
            }
        }
        packets.push(packet);
        Ok(())
    }
}

/// Passes packets on to a channel, e.g. to another socket's inbound queue
pub struct ChannelSink(pub mpsc::Sender<Packet>);

#[async_trait]
impl PacketSink for ChannelSink {
    async fn send_packet(&self, packet: Packet) -> Result<(), RdtpError> {
        self.0.send(packet).await
            .map_err(|_| RdtpError::forward_failed("test channel", "channel closed"))
    }
}
