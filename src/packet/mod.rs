pub mod flags;
mod checksum;

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::RdtpError;
use crate::packet::flags::Flags;

/// Maximum size of an RDTP packet including its header. Larger application writes are chunked.
pub const MAX_PACKET_BYTES: usize = 1500;

pub const HEADER_BYTES: usize = 17;

pub const MAX_PAYLOAD_BYTES: usize = MAX_PACKET_BYTES - HEADER_BYTES;

/// IP protocol number used for RDTP datagrams (unassigned by IANA).
pub const IP_PROTO_RDTP: u8 = 0x9d;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub src_port: u16,
    pub dst_port: u16,
    /// number of payload bytes
    pub length: u16,
    pub checksum: u16,

    pub seq_no: u32,
    pub ack_no: u32,

    pub flags: Flags,

    pub payload: Bytes,

    // network layer metadata, not part of the wire format
    source_ip: Option<Ipv4Addr>,
    destination_ip: Option<Ipv4Addr>,
}

impl Packet {
    pub fn new(src_port: u16, dst_port: u16, payload: Bytes) -> Result<Packet, RdtpError> {
        let length = match u16::try_from(payload.len()) {
            Ok(length) if payload.len() <= MAX_PAYLOAD_BYTES => length,
            _ => return Err(RdtpError::PayloadTooLarge(payload.len())),
        };

        Ok(Packet {
            src_port,
            dst_port,
            length,
            checksum: 0,
            seq_no: 0,
            ack_no: 0,
            flags: Flags::empty(),
            payload,
            source_ip: None,
            destination_ip: None,
        })
    }

    pub fn control(src_port: u16, dst_port: u16, flags: Flags) -> Packet {
        Packet {
            src_port,
            dst_port,
            length: 0,
            checksum: 0,
            seq_no: 0,
            ack_no: 0,
            flags,
            payload: Bytes::new(),
            source_ip: None,
            destination_ip: None,
        }
    }

    pub fn set_syn(&mut self) {
        self.flags.insert(Flags::SYN);
    }
    pub fn set_ack(&mut self) {
        self.flags.insert(Flags::ACK);
    }
    pub fn set_fin(&mut self) {
        self.flags.insert(Flags::FIN);
    }
    pub fn set_err(&mut self) {
        self.flags.insert(Flags::ERR);
    }

    pub fn is_syn(&self) -> bool {
        self.flags.contains(Flags::SYN)
    }
    pub fn is_ack(&self) -> bool {
        self.flags.contains(Flags::ACK)
    }
    pub fn is_fin(&self) -> bool {
        self.flags.contains(Flags::FIN)
    }
    pub fn is_err(&self) -> bool {
        self.flags.contains(Flags::ERR)
    }

    /// SYN without ACK, i.e. the first packet of a connection attempt
    pub fn is_bare_syn(&self) -> bool {
        self.is_syn() && !self.is_ack()
    }

    /// FIN without ACK, i.e. the peer starting a teardown
    pub fn is_bare_fin(&self) -> bool {
        self.is_fin() && !self.is_ack()
    }

    /// A zero-payload ACK acknowledging a data packet, as opposed to the ACK of a handshake
    pub fn is_data_ack(&self) -> bool {
        self.flags == Flags::ACK && self.payload.is_empty() && self.ack_no != 0
    }

    pub fn set_source_ip(&mut self, ip: Ipv4Addr) {
        self.source_ip = Some(ip);
    }

    pub fn set_destination_ip(&mut self, ip: Ipv4Addr) {
        self.destination_ip = Some(ip);
    }

    pub fn source_ip(&self) -> Result<Ipv4Addr, RdtpError> {
        self.source_ip.ok_or(RdtpError::MissingAddress("source"))
    }

    pub fn destination_ip(&self) -> Result<Ipv4Addr, RdtpError> {
        self.destination_ip.ok_or(RdtpError::MissingAddress("destination"))
    }

    pub fn serialized_len(&self) -> usize {
        HEADER_BYTES + self.payload.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.put_u16(self.length);
        buf.put_u16(self.checksum);
        buf.put_u32(self.seq_no);
        buf.put_u32(self.ack_no);
        buf.put_u8(self.flags.bits());
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Parses a packet from a datagram's RDTP part. Bytes beyond the announced payload length
    ///  (e.g. padding added by lower layers) are ignored.
    ///
    /// NB: This does not verify the checksum, see [Packet::verify_checksum]
    pub fn deser(mut buf: &[u8]) -> Result<Packet, RdtpError> {
        if buf.len() < HEADER_BYTES {
            return Err(RdtpError::MalformedHeader(buf.len()));
        }

        let src_port = buf.get_u16();
        let dst_port = buf.get_u16();
        let length = buf.get_u16();
        let checksum = buf.get_u16();
        let seq_no = buf.get_u32();
        let ack_no = buf.get_u32();
        let flags = Flags::from_bits_retain(buf.get_u8());

        if length as usize > buf.len() {
            return Err(RdtpError::LengthMismatch { announced: length, available: buf.len() });
        }

        Ok(Packet {
            src_port,
            dst_port,
            length,
            checksum,
            seq_no,
            ack_no,
            flags,
            payload: Bytes::copy_from_slice(&buf[..length as usize]),
            source_ip: None,
            destination_ip: None,
        })
    }
}
