use std::fmt::{Debug, Display, Formatter};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::RdtpError;
use crate::packet::flags::Flags;
use crate::packet::Packet;
use crate::packetizer::Packetizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Handshaking,
    Established,
    Finishing,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Drives the connection setup and teardown exchanges of a single connection:
///
/// ```ascii
/// connect:            send SYN       wait SYN,ACK   send ACK
/// accept:             send SYN,ACK   wait ACK
/// disconnect (local): send FIN       wait FIN,ACK   send ACK
/// disconnect (remote, after receiving FIN):
///                     send FIN,ACK   wait ACK
/// ```
///
/// All calls run to completion (or failure) in the caller's task, there is no state outside the
///  calls except for the connection state. Waiting consumes packets from the connection's
///  inbound queue, and each wait expects *exactly* the given flags. A failed exchange returns
///  the connection to `Closed`, and it is the caller's responsibility to abort the connection.
pub struct Handshake {
    state: ConnectionState,
    timeout: Duration,
}

impl Handshake {
    pub fn new(timeout: Duration) -> Handshake {
        Handshake {
            state: ConnectionState::Closed,
            timeout,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Active open
    pub async fn connect(&mut self, inbound: &mut mpsc::Receiver<Packet>, sender: &Packetizer) -> Result<(), RdtpError> {
        self.begin(ConnectionState::Closed, ConnectionState::Handshaking)?;

        let result = async {
            sender.send_control(true, false, false, false).await?;
            self.wait_for(inbound, Flags::SYN | Flags::ACK).await?;
            sender.send_control(false, true, false, false).await
        }.await;

        self.finish(result, ConnectionState::Established, "connect")
    }

    /// Passive open, after a listener was notified of the peer's SYN
    pub async fn accept(&mut self, inbound: &mut mpsc::Receiver<Packet>, sender: &Packetizer) -> Result<(), RdtpError> {
        self.begin(ConnectionState::Closed, ConnectionState::Handshaking)?;

        let result = async {
            sender.send_control(true, true, false, false).await?;
            self.wait_for(inbound, Flags::ACK).await.map(|_| ())
        }.await;

        self.finish(result, ConnectionState::Established, "accept")
    }

    pub async fn disconnect_local(&mut self, inbound: &mut mpsc::Receiver<Packet>, sender: &Packetizer) -> Result<(), RdtpError> {
        self.begin(ConnectionState::Established, ConnectionState::Finishing)?;

        let result = async {
            sender.send_control(false, false, true, false).await?;
            self.wait_for(inbound, Flags::FIN | Flags::ACK).await?;
            sender.send_control(false, true, false, false).await
        }.await;

        self.finish(result, ConnectionState::Closed, "local disconnect")
    }

    /// The peer's FIN is not read from `inbound` - it is signalled out of band before this is
    ///  called
    pub async fn disconnect_remote(&mut self, inbound: &mut mpsc::Receiver<Packet>, sender: &Packetizer) -> Result<(), RdtpError> {
        self.begin(ConnectionState::Established, ConnectionState::Finishing)?;

        let result = async {
            sender.send_control(false, true, true, false).await?;
            self.wait_for(inbound, Flags::ACK).await.map(|_| ())
        }.await;

        self.finish(result, ConnectionState::Closed, "remote disconnect")
    }

    /// Marks the connection closed without any exchange, e.g. after the peer reset it
    pub fn abort(&mut self) {
        self.state = ConnectionState::Closed;
    }

    fn begin(&mut self, required: ConnectionState, next: ConnectionState) -> Result<(), RdtpError> {
        if self.state != required {
            return Err(RdtpError::NotEstablished(format!("expected state {}, was {}", required, self.state)));
        }
        trace!("{} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    fn finish(&mut self, result: Result<(), RdtpError>, on_success: ConnectionState, what: &str) -> Result<(), RdtpError> {
        match &result {
            Ok(()) => {
                debug!("{} complete", what);
                self.state = on_success;
            }
            Err(e) => {
                debug!("{} failed: {}", what, e);
                self.state = ConnectionState::Closed;
            }
        }
        result
    }

    async fn wait_for(&self, inbound: &mut mpsc::Receiver<Packet>, expected: Flags) -> Result<Packet, RdtpError> {
        wait_for_control_packet(inbound, expected, self.timeout).await
    }
}

/// Waits for the next control packet on `inbound`, which must carry exactly the `expected`
///  flags. Data packets still arriving from the peer are skipped, the whole wait (including
///  skipped packets) is bounded by `wait`.
pub async fn wait_for_control_packet(inbound: &mut mpsc::Receiver<Packet>, expected: Flags, wait: Duration) -> Result<Packet, RdtpError> {
    let next_control_packet = async {
        while let Some(packet) = inbound.recv().await {
            if packet.payload.is_empty() {
                return Some(packet);
            }
            trace!("skipping data packet #{} while waiting for {}", packet.seq_no, expected);
        }
        None
    };

    match timeout(wait, next_control_packet).await {
        Err(_) => Err(RdtpError::OperationTimedOut),
        Ok(None) => Err(RdtpError::ConnectionReset),
        Ok(Some(packet)) => {
            if packet.flags != expected {
                return Err(RdtpError::UnexpectedPacket { expected, received: packet.flags });
            }
            trace!("received expected control packet {}", expected);
            Ok(packet)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use async_trait::async_trait;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use crate::addr::RdtpAddr;
    use crate::network::PacketSink;
    use super::*;

    /// Records the flags of every packet on the wire (in both directions) before passing it on
    ///  to the peer's inbound queue
    struct WireTap {
        log: Arc<Mutex<Vec<Flags>>>,
        to_peer: mpsc::Sender<Packet>,
    }

    #[async_trait]
    impl PacketSink for WireTap {
        async fn send_packet(&self, packet: Packet) -> Result<(), RdtpError> {
            self.log.lock().unwrap().push(packet.flags);
            self.to_peer.send(packet).await
                .map_err(|_| RdtpError::forward_failed("wire tap", "peer gone"))
        }
    }

    struct Side {
        inbound: mpsc::Receiver<Packet>,
        packetizer: Packetizer,
        handshake: Handshake,
    }

    fn connected_pair(wait: Duration) -> (Side, Side, Arc<Mutex<Vec<Flags>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (to_a, inbound_a) = mpsc::channel(10);
        let (to_b, inbound_b) = mpsc::channel(10);

        let addr_a = RdtpAddr::parse("10.0.0.1:5000").unwrap();
        let addr_b = RdtpAddr::parse("10.0.0.2:80").unwrap();

        let a = Side {
            inbound: inbound_a,
            packetizer: Packetizer::new(addr_a, addr_b, 100, Arc::new(WireTap { log: log.clone(), to_peer: to_b })).unwrap(),
            handshake: Handshake::new(wait),
        };
        let b = Side {
            inbound: inbound_b,
            packetizer: Packetizer::new(addr_b, addr_a, 100, Arc::new(WireTap { log: log.clone(), to_peer: to_a })).unwrap(),
            handshake: Handshake::new(wait),
        };
        (a, b, log)
    }

    fn single_side(wait: Duration) -> (Side, mpsc::Sender<Packet>, mpsc::Receiver<Packet>) {
        let (to_self, inbound) = mpsc::channel(10);
        let (to_peer, peer_inbound) = mpsc::channel(10);
        let side = Side {
            inbound,
            packetizer: Packetizer::new(
                RdtpAddr::parse("10.0.0.1:5000").unwrap(),
                RdtpAddr::parse("10.0.0.2:80").unwrap(),
                100,
                Arc::new(crate::test_util::ChannelSink(to_peer)),
            ).unwrap(),
            handshake: Handshake::new(wait),
        };
        (side, to_self, peer_inbound)
    }

    #[tokio::test]
    async fn test_connect_accept() {
        let (mut a, mut b, log) = connected_pair(Duration::from_secs(1));

        // the listener side learns about the SYN out of band (via a listener notification)
        let syn_seen = async {
            let syn = b.inbound.recv().await.unwrap();
            assert!(syn.is_bare_syn());
            b.handshake.accept(&mut b.inbound, &b.packetizer).await
        };

        let (connected, accepted) = tokio::join!(
            a.handshake.connect(&mut a.inbound, &a.packetizer),
            syn_seen,
        );
        connected.unwrap();
        accepted.unwrap();

        assert_eq!(a.handshake.state(), ConnectionState::Established);
        assert_eq!(b.handshake.state(), ConnectionState::Established);
        assert_eq!(*log.lock().unwrap(), vec![Flags::SYN, Flags::SYN | Flags::ACK, Flags::ACK]);
    }

    #[test]
    fn test_connect_timeout() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (mut side, _to_self, mut peer) = single_side(Duration::from_millis(1));

            let result = side.handshake.connect(&mut side.inbound, &side.packetizer).await;
            assert_eq!(result, Err(RdtpError::OperationTimedOut));
            assert_eq!(side.handshake.state(), ConnectionState::Closed);
            assert!(peer.recv().await.unwrap().is_bare_syn());
        });
    }

    #[rstest]
    #[case::bare_ack(Flags::ACK)]
    #[case::bare_syn(Flags::SYN)]
    #[case::syn_ack_err(Flags::SYN | Flags::ACK | Flags::ERR)]
    #[case::fin(Flags::FIN)]
    fn test_connect_unexpected(#[case] response: Flags) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (mut side, to_self, _peer) = single_side(Duration::from_secs(1));
            to_self.send(Packet::control(80, 5000, response)).await.unwrap();

            let result = side.handshake.connect(&mut side.inbound, &side.packetizer).await;
            assert_eq!(result, Err(RdtpError::UnexpectedPacket { expected: Flags::SYN | Flags::ACK, received: response }));
            assert_eq!(side.handshake.state(), ConnectionState::Closed);
        });
    }

    #[tokio::test]
    async fn test_accept_unexpected() {
        let (mut side, to_self, mut peer) = single_side(Duration::from_secs(1));
        to_self.send(Packet::control(80, 5000, Flags::SYN | Flags::ACK)).await.unwrap();

        let result = side.handshake.accept(&mut side.inbound, &side.packetizer).await;
        assert_eq!(result, Err(RdtpError::UnexpectedPacket { expected: Flags::ACK, received: Flags::SYN | Flags::ACK }));
        assert_eq!(peer.recv().await.unwrap().flags, Flags::SYN | Flags::ACK);
    }

    #[tokio::test]
    async fn test_wait_skips_data_packets() {
        let (to_self, mut inbound) = mpsc::channel(10);
        to_self.send(Packet::new(80, 5000, bytes::Bytes::from_static(b"late data")).unwrap()).await.unwrap();
        to_self.send(Packet::control(80, 5000, Flags::FIN | Flags::ACK)).await.unwrap();

        let packet = wait_for_control_packet(&mut inbound, Flags::FIN | Flags::ACK, Duration::from_secs(1)).await.unwrap();
        assert_eq!(packet.flags, Flags::FIN | Flags::ACK);
    }

    #[tokio::test]
    async fn test_wait_on_closed_queue() {
        let (to_self, mut inbound) = mpsc::channel::<Packet>(10);
        drop(to_self);

        let result = wait_for_control_packet(&mut inbound, Flags::ACK, Duration::from_secs(1)).await;
        assert_eq!(result.unwrap_err(), RdtpError::ConnectionReset);
    }

    #[tokio::test]
    async fn test_connect_send_failure() {
        let (mut side, _to_self, peer) = single_side(Duration::from_secs(1));
        drop(peer);

        let result = side.handshake.connect(&mut side.inbound, &side.packetizer).await;
        assert!(matches!(result, Err(RdtpError::ForwardFailed { .. })));
        assert_eq!(side.handshake.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_disconnect() {
        let (mut a, mut b, log) = connected_pair(Duration::from_secs(1));
        a.handshake.state = ConnectionState::Established;
        b.handshake.state = ConnectionState::Established;

        // the remote side learns about the FIN out of band (via the socket's fin signal)
        let remote = async {
            let fin = b.inbound.recv().await.unwrap();
            assert!(fin.is_bare_fin());
            b.handshake.disconnect_remote(&mut b.inbound, &b.packetizer).await
        };

        let (local, remote) = tokio::join!(
            a.handshake.disconnect_local(&mut a.inbound, &a.packetizer),
            remote,
        );
        local.unwrap();
        remote.unwrap();

        assert_eq!(a.handshake.state(), ConnectionState::Closed);
        assert_eq!(b.handshake.state(), ConnectionState::Closed);
        assert_eq!(*log.lock().unwrap(), vec![Flags::FIN, Flags::FIN | Flags::ACK, Flags::ACK]);
    }

    #[tokio::test]
    async fn test_disconnect_requires_established() {
        let (mut side, _to_self, _peer) = single_side(Duration::from_secs(1));

        let result = side.handshake.disconnect_local(&mut side.inbound, &side.packetizer).await;
        assert!(matches!(result, Err(RdtpError::NotEstablished(_))));
        assert_eq!(side.handshake.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_connect_twice() {
        let (mut side, _to_self, _peer) = single_side(Duration::from_secs(1));
        side.handshake.state = ConnectionState::Established;

        let result = side.handshake.connect(&mut side.inbound, &side.packetizer).await;
        assert!(matches!(result, Err(RdtpError::NotEstablished(_))));
        assert_eq!(side.handshake.state(), ConnectionState::Established);
    }

    #[test]
    fn test_disconnect_remote_timeout() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (mut side, _to_self, mut peer) = single_side(Duration::from_millis(1));
            side.handshake.state = ConnectionState::Established;

            let result = side.handshake.disconnect_remote(&mut side.inbound, &side.packetizer).await;
            assert_eq!(result, Err(RdtpError::OperationTimedOut));
            assert_eq!(side.handshake.state(), ConnectionState::Closed);
            assert_eq!(peer.recv().await.unwrap().flags, Flags::FIN | Flags::ACK);
        });
    }
}
