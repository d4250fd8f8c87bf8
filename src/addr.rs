use std::fmt::{Debug, Display, Formatter};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RdtpError;
use crate::packet::Packet;

/// An RDTP endpoint: an IPv4 host and an RDTP port. RDTP ports are independent of TCP / UDP
///  ports since RDTP runs directly on top of IP.
///
/// The JSON representation (used by the local IPC protocol) is `{"host": "a.b.c.d", "port": n}`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RdtpAddr {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl RdtpAddr {
    pub const fn new(host: Ipv4Addr, port: u16) -> RdtpAddr {
        RdtpAddr { host, port }
    }

    pub fn parse(s: &str) -> Result<RdtpAddr, RdtpError> {
        s.parse()
    }
}

impl Default for RdtpAddr {
    fn default() -> Self {
        RdtpAddr::new(Ipv4Addr::UNSPECIFIED, 0)
    }
}

impl FromStr for RdtpAddr {
    type Err = RdtpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = SocketAddrV4::from_str(s)
            .map_err(|e| RdtpError::InvalidConfig(format!("invalid RDTP address {:?}: {}", s, e)))?;
        Ok(RdtpAddr::new(*addr.ip(), addr.port()))
    }
}

impl Display for RdtpAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl Debug for RdtpAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// The 4-tuple identifying a connection, seen from this side of the connection. Its string
///  form `"localIP:localPort remoteIP:remotePort"` is the stable key used in logs and error
///  messages.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub local: RdtpAddr,
    pub remote: RdtpAddr,
}

impl ConnectionId {
    pub fn new(local: RdtpAddr, remote: RdtpAddr) -> ConnectionId {
        ConnectionId { local, remote }
    }

    /// For an inbound packet, 'local' is the destination and 'remote' is the source. Both
    ///  network addresses must be present on the packet.
    pub fn for_inbound(packet: &Packet) -> Result<ConnectionId, RdtpError> {
        Ok(ConnectionId {
            local: RdtpAddr::new(packet.destination_ip()?, packet.dst_port),
            remote: RdtpAddr::new(packet.source_ip()?, packet.src_port),
        })
    }

    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.local, self.remote)
    }
}

impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self)
    }
}
