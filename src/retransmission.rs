use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::error::RdtpError;
use crate::network::PacketSink;
use crate::packet::Packet;

struct InFlight {
    packet: Packet,
    deadline: Instant,
    num_retransmits: u32,
}

struct TrackerInner {
    in_flight: FxHashMap<u32, InFlight>,
    /// Deadlines of in-flight packets, earliest first. Entries are not removed when a packet is
    ///  acknowledged or rescheduled, so an entry is only valid if it matches the in-flight
    ///  packet's current deadline.
    deadlines: BinaryHeap<Reverse<(Instant, u32)>>,
    ack_wait: Duration,
}

impl TrackerInner {
    fn is_current(&self, deadline: Instant, seq_no: u32) -> bool {
        self.in_flight.get(&seq_no)
            .map(|e| e.deadline == deadline)
            .unwrap_or(false)
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&Reverse((deadline, seq_no))) = self.deadlines.peek() {
            if self.is_current(deadline, seq_no) {
                return Some(deadline);
            }
            self.deadlines.pop();
        }
        None
    }
}

/// The retransmission tracker ('air traffic control') keeps every data packet that was sent
///  but not acknowledged yet, and re-sends it through the same sink when its ack wait expires.
///
/// Zero-payload control packets pass through untracked: their delivery is the handshake's
///  business, which has its own timeout.
///
/// If a packet's forwarding fails on its initial send, it is *not* kept for retransmission - the
///  error goes to the caller, which treats the connection as broken.
pub struct RetransmissionTracker {
    inner: Mutex<TrackerInner>,
    sink: Arc<dyn PacketSink>,
    max_retransmits: u32,
    new_deadline: Notify,
    drained: Notify,
}

impl RetransmissionTracker {
    pub fn new(sink: Arc<dyn PacketSink>, ack_wait: Duration, max_retransmits: u32) -> RetransmissionTracker {
        RetransmissionTracker {
            inner: Mutex::new(TrackerInner {
                in_flight: FxHashMap::default(),
                deadlines: BinaryHeap::new(),
                ack_wait,
            }),
            sink,
            max_retransmits,
            new_deadline: Notify::new(),
            drained: Notify::new(),
        }
    }

    pub async fn send(&self, packet: Packet) -> Result<(), RdtpError> {
        if packet.payload.is_empty() {
            return self.sink.send_packet(packet).await;
        }

        let seq_no = packet.seq_no;
        {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let deadline = Instant::now() + inner.ack_wait;
            inner.in_flight.insert(seq_no, InFlight {
                packet: packet.clone(),
                deadline,
                num_retransmits: 0,
            });
            inner.deadlines.push(Reverse((deadline, seq_no)));
        }
        self.new_deadline.notify_one();

        if let Err(e) = self.sink.send_packet(packet).await {
            debug!("forwarding packet #{} failed, not tracking it for retransmission: {}", seq_no, e);
            self.remove(seq_no);
            return Err(e);
        }
        Ok(())
    }

    /// Acknowledging an unknown (or already acknowledged) packet is not an error: duplicate
    ///  and late ACKs are expected.
    pub fn ack(&self, seq_no: u32) {
        if self.remove(seq_no) {
            trace!("packet #{} acknowledged", seq_no);
        }
        else {
            trace!("ignoring ACK for packet #{} which is not in flight", seq_no);
        }
    }

    fn remove(&self, seq_no: u32) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = inner.in_flight.remove(&seq_no).is_some();
        if inner.in_flight.is_empty() {
            self.drained.notify_waiters();
        }
        removed
    }

    /// Returns once no packet is in flight any more
    pub async fn wait_drained(&self) {
        loop {
            let drained = self.drained.notified();
            if self.in_flight_len() == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Applies to packets sent (or re-sent) after the call
    pub fn set_ack_wait(&self, ack_wait: Duration) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).ack_wait = ack_wait;
    }

    pub fn ack_wait(&self) -> Duration {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).ack_wait
    }

    pub fn contains(&self, seq_no: u32) -> bool {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).in_flight.contains_key(&seq_no)
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).in_flight.len()
    }

    /// Re-sends packets whose ack wait expired. This runs until a packet exceeds the maximum
    ///  number of retransmissions, returning [RdtpError::RetransmitExhausted] for it, so the
    ///  owning connection can be torn down. Callers cancel the loop by dropping the future.
    pub async fn run_resend_loop(&self) -> Result<(), RdtpError> {
        loop {
            let next_deadline = self.inner.lock().unwrap_or_else(PoisonError::into_inner).next_deadline();

            match next_deadline {
                Some(deadline) => {
                    select! {
                        _ = sleep_until(deadline) => {}
                        _ = self.new_deadline.notified() => continue,
                    }
                }
                None => {
                    self.new_deadline.notified().await;
                    continue;
                }
            }

            for packet in self.collect_due()? {
                debug!("re-sending unacknowledged packet #{}", packet.seq_no);
                if let Err(e) = self.sink.send_packet(packet).await {
                    // the packet stays in flight, so it is retried with the next deadline
                    warn!("re-sending packet failed: {}", e);
                }
            }
        }
    }

    fn collect_due(&self) -> Result<Vec<Packet>, RdtpError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let ack_wait = inner.ack_wait;

        let mut due = Vec::new();
        while let Some(deadline) = inner.next_deadline() {
            if deadline > now {
                break;
            }
            let Some(Reverse((_, seq_no))) = inner.deadlines.pop() else {
                break;
            };

            let Some(entry) = inner.in_flight.get_mut(&seq_no) else {
                continue;
            };
            if entry.num_retransmits >= self.max_retransmits {
                warn!("packet #{} not acknowledged after {} retransmissions", seq_no, entry.num_retransmits);
                return Err(RdtpError::RetransmitExhausted(seq_no));
            }
            entry.num_retransmits += 1;
            entry.deadline = now + ack_wait;
            due.push(entry.packet.clone());

            inner.deadlines.push(Reverse((now + ack_wait, seq_no)));
        }
        Ok(due)
    }
}

/// A connection's packetizer forwards its data through the tracker
#[async_trait]
impl PacketSink for RetransmissionTracker {
    async fn send_packet(&self, packet: Packet) -> Result<(), RdtpError> {
        self.send(packet).await
    }
}
