use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::RdtpError;
use crate::network::{Network, PacketSink};
use crate::packet::Packet;

const HOST_QUEUE_CAPACITY: usize = 1024;

/// A datagram on the simulated wire: source IP, destination IP and the encoded RDTP packet
type Datagram = (Ipv4Addr, Ipv4Addr, Bytes);

type DropFilter = Box<dyn FnMut(&Packet) -> bool + Send>;

/// An in-memory 'IP network' connecting any number of simulated hosts. Packets travel through
///  the wire in encoded form, so everything sent over it passes the codec on both ends.
///
/// Like a real network, the wire loses datagrams rather than failing the sender: datagrams for
///  unknown hosts, datagrams that overflow a host's queue and datagrams matched by the drop
///  filter disappear silently.
#[derive(Default)]
pub struct MemoryWire {
    hosts: RwLock<FxHashMap<Ipv4Addr, mpsc::Sender<Datagram>>>,
    drop_filter: Mutex<Option<DropFilter>>,
}

impl MemoryWire {
    pub fn new() -> Arc<MemoryWire> {
        Arc::new(MemoryWire::default())
    }

    pub fn attach(self: &Arc<Self>, ip: Ipv4Addr) -> MemoryNetwork {
        let (send, recv) = mpsc::channel(HOST_QUEUE_CAPACITY);
        self.hosts.write().unwrap_or_else(PoisonError::into_inner)
            .insert(ip, send);

        MemoryNetwork {
            ip,
            wire: self.clone(),
            inbound: tokio::sync::Mutex::new(recv),
        }
    }

    pub fn detach(&self, ip: Ipv4Addr) {
        self.hosts.write().unwrap_or_else(PoisonError::into_inner)
            .remove(&ip);
    }

    /// Packets for which the filter returns `true` are lost on the wire
    pub fn set_drop_filter(&self, filter: impl FnMut(&Packet) -> bool + Send + 'static) {
        *self.drop_filter.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        *self.drop_filter.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn transmit(&self, packet: &Packet, from: Ipv4Addr, to: Ipv4Addr) {
        if let Some(filter) = self.drop_filter.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            if filter(packet) {
                debug!("wire: dropping packet {}:{} -> {}:{} {}", from, packet.src_port, to, packet.dst_port, packet.flags);
                return;
            }
        }

        let hosts = self.hosts.read().unwrap_or_else(PoisonError::into_inner);
        match hosts.get(&to) {
            Some(host) => {
                if host.try_send((from, to, packet.to_bytes())).is_err() {
                    debug!("wire: host {} does not accept datagrams, dropping", to);
                }
            }
            None => trace!("wire: no host {}, dropping", to),
        }
    }
}

pub struct MemoryNetwork {
    ip: Ipv4Addr,
    wire: Arc<MemoryWire>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Datagram>>,
}

impl MemoryNetwork {
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }
}

#[async_trait]
impl PacketSink for MemoryNetwork {
    async fn send_packet(&self, packet: Packet) -> Result<(), RdtpError> {
        let to = packet.destination_ip()?;
        let from = packet.source_ip().unwrap_or(self.ip);

        trace!("wire: sending {} bytes {}:{} -> {}:{}", packet.serialized_len(), from, packet.src_port, to, packet.dst_port);
        self.wire.transmit(&packet, from, to);
        Ok(())
    }
}

#[async_trait]
impl Network for MemoryNetwork {
    async fn recv_packet(&self) -> anyhow::Result<Option<Packet>> {
        let (from, to, buf) = match self.inbound.lock().await.recv().await {
            Some(datagram) => datagram,
            None => return Ok(None),
        };

        let mut packet = Packet::deser(&buf)
            .map_err(|e| anyhow!("could not deserialize datagram from {}: {}", from, e))?;
        packet.set_source_ip(from);
        packet.set_destination_ip(to);
        Ok(Some(packet))
    }
}

impl Drop for MemoryNetwork {
    fn drop(&mut self) {
        self.wire.detach(self.ip);
    }
}
