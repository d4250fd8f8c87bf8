use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::addr::{ConnectionId, RdtpAddr};
use crate::error::RdtpError;
use crate::listener::Listener;
use crate::packet::Packet;
use crate::socket::Socket;

/// The single point through which every inbound packet is routed: connection requests go to
///  the listener on the packet's destination port, everything else to the socket registered
///  for the packet's 4-tuple.
///
/// The registries are lookup-heavy, so they are guarded by reader / writer locks. Locks are
///  never held while delivering to a socket: delivery can block on a socket's full inbound
///  queue, and that must not stall registration of other connections.
#[derive(Default)]
pub struct Multiplexer {
    sockets: RwLock<FxHashMap<ConnectionId, Arc<Socket>>>,
    listeners: RwLock<FxHashMap<u16, Listener>>,
}

impl Multiplexer {
    pub fn new() -> Multiplexer {
        Multiplexer::default()
    }

    /// Registers a socket for its 4-tuple, which must not be in use
    pub async fn put(&self, socket: Arc<Socket>) -> Result<(), RdtpError> {
        let id = socket.id();
        let mut sockets = self.sockets.write().await;
        if sockets.contains_key(&id) {
            return Err(RdtpError::AddressInUse(id.key()));
        }
        debug!("registering socket {}", id);
        sockets.insert(id, socket);
        Ok(())
    }

    /// Removes and closes the socket for a 4-tuple. Evicting an unknown 4-tuple is a no-op.
    pub async fn evict(&self, id: &ConnectionId) {
        let removed = self.sockets.write().await.remove(id);
        if let Some(socket) = removed {
            debug!("evicted socket {}", id);
            socket.close();
        }
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<Arc<Socket>> {
        self.sockets.read().await
            .get(id)
            .cloned()
    }

    pub async fn attach_listener(&self, listener: Listener) -> Result<(), RdtpError> {
        let port = listener.port();
        let mut listeners = self.listeners.write().await;
        if listeners.contains_key(&port) {
            return Err(RdtpError::PortInUse(port));
        }
        debug!("listening on port {}", port);
        listeners.insert(port, listener);
        Ok(())
    }

    /// Removes the listener for a port, closing its notification channel. No-op if there is no
    ///  listener on the port.
    pub async fn detach_listener(&self, port: u16) {
        if self.listeners.write().await.remove(&port).is_some() {
            debug!("stopped listening on port {}", port);
        }
    }

    pub async fn socket_count(&self) -> usize {
        self.sockets.read().await.len()
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    /// Routes an inbound packet. The packet's network addresses must be set.
    ///
    /// * A bare SYN notifies the listener on its destination port of the requesting endpoint
    /// * A bare FIN signals the connection's socket that the peer started a teardown. The
    ///    socket stays registered until its owner evicts it, so the teardown's ACK can still
    ///    be routed to it. A FIN for an unknown connection is ignored.
    /// * Everything else goes to the connection's socket
    ///
    /// Errors mean the packet was dropped. They concern only this packet and are meant to be
    ///  logged by the caller rather than treated as I/O failures.
    pub async fn deliver(&self, packet: Packet) -> Result<(), RdtpError> {
        if !packet.verify_checksum() {
            return Err(RdtpError::ChecksumMismatch);
        }

        if packet.is_bare_syn() {
            let remote = RdtpAddr::new(packet.source_ip()?, packet.src_port);
            return match self.listeners.read().await.get(&packet.dst_port) {
                Some(listener) => listener.notify(remote),
                None => Err(RdtpError::NoListener(packet.dst_port)),
            };
        }

        let id = ConnectionId::for_inbound(&packet)?;
        let socket = self.get(&id).await;

        if packet.is_bare_fin() {
            match socket {
                Some(socket) => socket.deliver(packet).await?,
                None => trace!("ignoring FIN for unknown connection {}", id),
            }
            return Ok(());
        }

        match socket {
            Some(socket) => socket.deliver(packet).await,
            None => Err(RdtpError::SocketNotActive(id.key())),
        }
    }
}
