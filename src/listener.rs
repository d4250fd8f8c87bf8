use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::addr::RdtpAddr;
use crate::error::RdtpError;

/// A local RDTP port awaiting inbound connections. The multiplexer notifies it of every
///  connection request (bare SYN) for its port, passing on the requesting remote endpoint; the
///  receiving end of the notifications is owned by whoever listens, typically an IPC session.
///
/// Notifications never block the network receiver: if the listening side does not keep up and
///  its backlog is full, the request is dropped (the peer's connect attempt times out).
///  Dropping the `Listener` closes the notification channel.
pub struct Listener {
    port: u16,
    notifications: mpsc::Sender<RdtpAddr>,
}

impl Listener {
    pub fn new(port: u16, backlog: usize) -> (Listener, mpsc::Receiver<RdtpAddr>) {
        let (send, recv) = mpsc::channel(backlog);
        let listener = Listener {
            port,
            notifications: send,
        };
        (listener, recv)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn notify(&self, remote: RdtpAddr) -> Result<(), RdtpError> {
        match self.notifications.try_send(remote) {
            Ok(()) => {
                debug!("notified listener on port {} of connection request from {}", self.port, remote);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                warn!("backlog of listener on port {} is full, dropping connection request from {}", self.port, remote);
                Err(RdtpError::ListenerUnavailable(self.port))
            }
            Err(TrySendError::Closed(_)) => {
                debug!("listener on port {} is closed", self.port);
                Err(RdtpError::ListenerUnavailable(self.port))
            }
        }
    }

    /// true once the listening side stopped receiving notifications
    pub fn is_closed(&self) -> bool {
        self.notifications.is_closed()
    }
}
