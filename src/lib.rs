//! RDTP is a connection-oriented transport protocol running directly on top of IP (protocol
//!  number 0x9D). It provides TCP style byte streams between two endpoints, with a three-way
//!  handshake for setting up connections, acknowledgement and retransmission of data, and an
//!  explicit teardown exchange.
//!
//! ## Wire format
//!
//! Every packet starts with a 17 byte header, all numbers are big-endian:
//!
//! ```ascii
//!  0: source port (u16)
//!  2: destination port (u16)
//!  4: payload length (u16)
//!  6: checksum (u16)
//!  8: sequence number (u32)
//! 12: acknowledgement number (u32)
//! 16: flags (u8): SYN = 0x80, ACK = 0x40, FIN = 0x20, ERR = 0x10
//! 17: payload
//! ```
//!
//! The checksum is the complement of the wrapping 16 bit sum over ports, length, sequence and
//!  acknowledgement numbers (as 16 bit halves), flags and every payload byte. Packets are at
//!  most 1500 bytes including the header, so payloads are at most 1483 bytes.
//!
//! ## Connections
//!
//! ```ascii
//! open:      A --SYN-->  B       (B's listener is notified, B accepts)
//!            A <--SYN,ACK-- B
//!            A --ACK-->  B
//! data:      A --data #n--> B
//!            A <--ACK (ack_no = n)-- B
//! close:     A --FIN--> B
//!            A <--FIN,ACK-- B
//!            A --ACK--> B
//! ```
//!
//! Control packets carry no payload and sequence number 0, data packets are numbered from 1.
//!  A data packet that is not acknowledged in time is sent again, and a connection is aborted
//!  (with an ERR packet to the peer) when a packet exhausts its retransmissions. Received data
//!  is delivered in the order of arrival, there is no resequencing.
//!
//! Applications use the protocol through a local service (see [service]) that speaks a small
//!  JSON based IPC protocol and hands out connections as byte streams.

pub mod addr;
pub mod config;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod multiplexer;
pub mod network;
pub mod packet;
pub mod packetizer;
pub mod retransmission;
pub mod service;
pub mod socket;

#[cfg(test)] mod test_util;
