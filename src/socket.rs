use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;
use rustc_hash::FxHashSet;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, span, trace, warn, Instrument, Level};

use crate::addr::{ConnectionId, RdtpAddr};
use crate::config::RdtpConfig;
use crate::error::RdtpError;
use crate::handshake::{ConnectionState, Handshake};
use crate::network::PacketSink;
use crate::packet::Packet;
use crate::packetizer::Packetizer;
use crate::retransmission::RetransmissionTracker;

/// Number of recently delivered sequence numbers remembered for filtering retransmitted
///  duplicates
const DUPLICATE_WINDOW: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The application finished sending, or the socket was closed locally
    LocalClose,
    /// The peer started a teardown (bare FIN)
    RemoteFin,
    /// The peer sent ERR
    Reset,
    Aborted(RdtpError),
}

impl ShutdownReason {
    fn is_failure(&self) -> bool {
        matches!(self, ShutdownReason::Reset | ShutdownReason::Aborted(_))
    }
}

/// Parts of the socket that are owned by whichever task drives the connection: the handshake
///  while opening, the pumps and teardown while running
struct SocketIo {
    inbound: mpsc::Receiver<Packet>,
    fin_observed: oneshot::Receiver<()>,
    handshake: Handshake,
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One RDTP connection.
///
/// A socket is opened with [Socket::connect] or [Socket::accept], and then [Socket::run] moves
///  data between the application side (any async byte stream) and the network until either
///  side closes the connection:
///
/// * The *receive pump* writes the payload of inbound data packets to the application and
///    acknowledges them
/// * The *transmit pump* reads from the application and forwards the data through the
///    packetizer. Outbound data packets pass through a [RetransmissionTracker], and a resend
///    loop re-sends them until they are acknowledged
///
/// Inbound packets arrive through [Socket::deliver] (called by the multiplexer). They are
///  sorted there: data acknowledgements go to the tracker directly, a peer's FIN is signalled
///  out of band, everything else is queued for the handshake or the receive pump. The queue is
///  bounded, and a full queue blocks the caller.
///
/// Packets are processed in the order they arrive. There is no resequencing, only retransmitted
///  duplicates are filtered out.
pub struct Socket {
    id: ConnectionId,
    inbound: mpsc::Sender<Packet>,
    tracker: Arc<RetransmissionTracker>,
    packetizer: Packetizer,
    shutdown: watch::Sender<Option<ShutdownReason>>,
    /// Set once the teardown path is chosen, after which the shutdown reason is final
    teardown_committed: AtomicBool,
    fin_signal: Mutex<Option<oneshot::Sender<()>>>,
    io: Mutex<Option<SocketIo>>,
    state: Mutex<ConnectionState>,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
}

impl Socket {
    /// Both addresses must be concrete endpoints of the form `a.b.c.d:port`
    pub fn new(config: Arc<RdtpConfig>, local_addr: &str, remote_addr: &str, network: Arc<dyn PacketSink>) -> Result<Arc<Socket>, RdtpError> {
        let local = RdtpAddr::parse(local_addr)?;
        let remote = RdtpAddr::parse(remote_addr)?;
        Socket::for_connection(config, ConnectionId::new(local, remote), network)
    }

    pub fn for_connection(config: Arc<RdtpConfig>, id: ConnectionId, network: Arc<dyn PacketSink>) -> Result<Arc<Socket>, RdtpError> {
        config.validate()
            .map_err(|e| RdtpError::InvalidConfig(e.to_string()))?;
        check_endpoint(&id.local, "local")?;
        check_endpoint(&id.remote, "remote")?;

        let tracker = Arc::new(RetransmissionTracker::new(network, config.ack_wait, config.max_retransmits));
        let packetizer = Packetizer::new(id.local, id.remote, config.chunk_size, tracker.clone())?;

        let (inbound_send, inbound_recv) = mpsc::channel(config.inbound_queue_capacity);
        let (fin_send, fin_recv) = oneshot::channel();
        let (shutdown, _) = watch::channel(None);

        Ok(Arc::new(Socket {
            id,
            inbound: inbound_send,
            tracker,
            packetizer,
            shutdown,
            teardown_committed: AtomicBool::new(false),
            fin_signal: Mutex::new(Some(fin_send)),
            io: Mutex::new(Some(SocketIo {
                inbound: inbound_recv,
                fin_observed: fin_recv,
                handshake: Handshake::new(config.handshake_timeout),
            })),
            state: Mutex::new(ConnectionState::Closed),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
        }))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local_addr(&self) -> RdtpAddr {
        self.id.local
    }

    pub fn remote_addr(&self) -> RdtpAddr {
        self.id.remote
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Application bytes handed to the network so far
    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    /// Application bytes received from the peer so far
    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    pub fn tracker(&self) -> &RetransmissionTracker {
        &self.tracker
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.shutdown.borrow().clone()
    }

    pub async fn connect(&self) -> Result<(), RdtpError> {
        self.open(true).await
    }

    pub async fn accept(&self) -> Result<(), RdtpError> {
        self.open(false).await
    }

    async fn open(&self, active: bool) -> Result<(), RdtpError> {
        let mut io = self.take_io()?;

        let result = if active {
            io.handshake.connect(&mut io.inbound, &self.packetizer).await
        }
        else {
            io.handshake.accept(&mut io.inbound, &self.packetizer).await
        };

        self.set_state(io.handshake.state());
        *self.io.lock().unwrap_or_else(PoisonError::into_inner) = Some(io);

        if let Err(e) = &result {
            self.abort(e.clone());
        }
        result
    }

    /// Runs the established connection with `application` as its application side, returning
    ///  after the connection was torn down. Returns `Ok` if the teardown handshake completed,
    ///  and an error if the connection was aborted or reset or the teardown failed.
    pub async fn run<A>(self: &Arc<Self>, application: A) -> Result<(), RdtpError>
    where A: AsyncRead + AsyncWrite + Send + 'static
    {
        let io = self.take_io()?;
        if io.handshake.state() != ConnectionState::Established {
            *self.io.lock().unwrap_or_else(PoisonError::into_inner) = Some(io);
            return Err(RdtpError::NotEstablished(self.id.key()));
        }
        let SocketIo { inbound, mut fin_observed, mut handshake } = io;

        let span = span!(Level::INFO, "socket", id = %self.id);
        info!(parent: &span, "connection established");

        let (reader, writer) = tokio::io::split(application);
        let (stop_transmit, stop_transmit_recv) = watch::channel(false);
        let (stop_receive, stop_receive_recv) = watch::channel(false);

        let transmit = tokio::spawn(self.clone().transmit_pump(reader, stop_transmit_recv).instrument(span.clone()));
        let receive = tokio::spawn(self.clone().receive_pump(inbound, writer, stop_receive_recv).instrument(span.clone()));
        let mut resend = AbortOnDrop(tokio::spawn(self.clone().resend_loop().instrument(span.clone())));

        async move {
            let requested = self.wait_for_shutdown(&mut fin_observed).await;
            debug!("shutting down: {:?}", requested);

            stop_transmit.send_replace(true);
            let _reader = transmit.await
                .map_err(|e| RdtpError::TaskFailed(e.to_string()))?;

            if requested == ShutdownReason::LocalClose {
                // data the application handed over before closing is delivered before the FIN,
                //  unless the connection fails in the meantime
                select! {
                    _ = self.tracker.wait_drained() => {}
                    _ = &mut resend.0 => {}
                    _ = failure_requested(self.shutdown.subscribe()) => {}
                }
            }

            let reason = self.commit_teardown();
            if reason != requested {
                debug!("shutdown reason changed to {:?} before teardown", reason);
            }

            stop_receive.send_replace(true);
            let (mut inbound, mut writer) = receive.await
                .map_err(|e| RdtpError::TaskFailed(e.to_string()))?;
            drop(resend);

            let result = match reason {
                ShutdownReason::LocalClose => handshake.disconnect_local(&mut inbound, &self.packetizer).await,
                ShutdownReason::RemoteFin => handshake.disconnect_remote(&mut inbound, &self.packetizer).await,
                ShutdownReason::Reset => {
                    handshake.abort();
                    Err(RdtpError::ConnectionReset)
                }
                ShutdownReason::Aborted(e) => {
                    handshake.abort();
                    if let Err(send_err) = self.packetizer.send_control(false, false, false, true).await {
                        debug!("could not notify peer of the abort: {}", send_err);
                    }
                    Err(e)
                }
            };
            self.set_state(handshake.state());

            if let Err(e) = writer.shutdown().await {
                debug!("could not shut down application side: {}", e);
            }

            match &result {
                Ok(()) => info!("connection closed, {} bytes sent, {} bytes received", self.tx_bytes(), self.rx_bytes()),
                Err(e) => warn!("connection terminated: {}", e),
            }
            result
        }.instrument(span).await
    }

    /// Routes an inbound packet for this connection
    pub async fn deliver(&self, packet: Packet) -> Result<(), RdtpError> {
        if packet.is_err() {
            warn!("connection {} reset by peer", self.id);
            self.shutdown_with(ShutdownReason::Reset);
            return Ok(());
        }
        if packet.is_bare_fin() {
            self.signal_fin();
            return Ok(());
        }
        if packet.is_data_ack() {
            self.tracker.ack(packet.ack_no);
            return Ok(());
        }

        self.inbound.send(packet).await
            .map_err(|_| RdtpError::SocketNotActive(self.id.key()))
    }

    /// Starts a locally initiated teardown. This is a no-op if the connection is shutting
    ///  down already.
    pub fn close(&self) {
        self.shutdown_with(ShutdownReason::LocalClose);
    }

    pub fn abort(&self, error: RdtpError) {
        self.shutdown_with(ShutdownReason::Aborted(error));
    }

    /// The first shutdown reason wins and later requests are ignored, with one exception: a
    ///  failure (reset or abort) replaces a local close as long as the teardown has not
    ///  started.
    fn shutdown_with(&self, reason: ShutdownReason) {
        let description = format!("{:?}", reason);
        let accepted = self.shutdown.send_if_modified(|current| {
            let replace = match current {
                None => true,
                Some(ShutdownReason::LocalClose) => reason.is_failure() && !self.teardown_committed.load(Ordering::Acquire),
                Some(_) => false,
            };
            if replace {
                *current = Some(reason);
            }
            replace
        });

        if accepted {
            debug!("shutdown of {} requested: {}", self.id, description);
        }
        else {
            trace!("{} is shutting down already, ignoring {}", self.id, description);
        }
    }

    /// Fixes the shutdown reason the teardown acts on. This runs under the shutdown channel's
    ///  lock, so it is ordered with respect to [Socket::shutdown_with].
    fn commit_teardown(&self) -> ShutdownReason {
        let mut reason = ShutdownReason::LocalClose;
        self.shutdown.send_if_modified(|current| {
            self.teardown_committed.store(true, Ordering::Release);
            if let Some(current) = current {
                reason = current.clone();
            }
            false
        });
        reason
    }

    fn signal_fin(&self) {
        match self.fin_signal.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(signal) => {
                debug!("peer of {} started teardown", self.id);
                let _ = signal.send(());
            }
            None => trace!("ignoring repeated FIN for {}", self.id),
        }
    }

    async fn wait_for_shutdown(&self, fin_observed: &mut oneshot::Receiver<()>) -> ShutdownReason {
        select! {
            Ok(()) = fin_observed => self.shutdown_with(ShutdownReason::RemoteFin),
            _ = shutdown_requested(self.shutdown.subscribe()) => {}
        }
        self.shutdown_reason()
            .unwrap_or(ShutdownReason::LocalClose)
    }

    async fn resend_loop(self: Arc<Self>) {
        if let Err(e) = self.tracker.run_resend_loop().await {
            warn!("aborting connection: {}", e);
            self.abort(e);
        }
    }

    async fn receive_pump<W>(self: Arc<Self>, mut inbound: mpsc::Receiver<Packet>, mut application: W, mut stop: watch::Receiver<bool>) -> (mpsc::Receiver<Packet>, W)
    where W: AsyncWrite + Unpin
    {
        let mut delivered = RecentSeqNos::new(DUPLICATE_WINDOW);
        let mut application_open = true;

        loop {
            select! {
                biased;
                _ = stop.changed() => break,
                packet = inbound.recv() => match packet {
                    Some(packet) => self.on_inbound(packet, &mut application, &mut delivered, &mut application_open).await,
                    None => break,
                },
            }
        }

        // packets that were queued before the stop signal still belong to the application
        while let Ok(packet) = inbound.try_recv() {
            self.on_inbound(packet, &mut application, &mut delivered, &mut application_open).await;
        }

        trace!("receive pump stopped");
        (inbound, application)
    }

    async fn on_inbound<W>(&self, packet: Packet, application: &mut W, delivered: &mut RecentSeqNos, application_open: &mut bool)
    where W: AsyncWrite + Unpin
    {
        if packet.payload.is_empty() {
            debug!("ignoring control packet {} on established connection", packet.flags);
            return;
        }
        if !*application_open {
            trace!("application side is closed, dropping packet #{}", packet.seq_no);
            return;
        }

        if delivered.insert(packet.seq_no) {
            if let Err(e) = application.write_all(&packet.payload).await {
                debug!("could not write to application: {}", e);
                *application_open = false;
                self.close();
                return;
            }
            self.rx_bytes.fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
            trace!("delivered packet #{} with {} bytes", packet.seq_no, packet.payload.len());
        }
        else {
            trace!("packet #{} was delivered before, acknowledging it again", packet.seq_no);
        }

        if let Err(e) = self.packetizer.send_data_ack(packet.seq_no).await {
            warn!("could not acknowledge packet #{}: {}", packet.seq_no, e);
        }
    }

    async fn transmit_pump<R>(self: Arc<Self>, mut application: R, mut stop: watch::Receiver<bool>) -> R
    where R: AsyncRead + Unpin
    {
        let read_size = self.packetizer.max_chunk_size();
        let mut buf = BytesMut::with_capacity(read_size);

        loop {
            buf.reserve(read_size);

            select! {
                biased;
                _ = stop.changed() => break,
                read = application.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        debug!("application closed its side of the connection");
                        self.close();
                        break;
                    }
                    Ok(_) => {
                        let data = buf.split().freeze();
                        match self.packetizer.pack_and_forward(data).await {
                            Ok(sent) => {
                                self.tx_bytes.fetch_add(sent as u64, Ordering::Relaxed);
                            }
                            Err(e) => {
                                warn!("forwarding application data failed: {}", e);
                                self.tx_bytes.fetch_add(e.sent as u64, Ordering::Relaxed);
                                self.abort(e.error);
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("could not read from application: {}", e);
                        self.close();
                        break;
                    }
                },
            }
        }

        trace!("transmit pump stopped");
        application
    }

    fn take_io(&self) -> Result<SocketIo, RdtpError> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| RdtpError::NotEstablished(self.id.key()))
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

fn check_endpoint(addr: &RdtpAddr, which: &str) -> Result<(), RdtpError> {
    if addr.host.is_unspecified() || addr.port == 0 {
        return Err(RdtpError::InvalidConfig(format!("{} address {} is not a valid endpoint", which, addr)));
    }
    Ok(())
}

async fn shutdown_requested(mut shutdown: watch::Receiver<Option<ShutdownReason>>) {
    while shutdown.borrow_and_update().is_none() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn failure_requested(mut shutdown: watch::Receiver<Option<ShutdownReason>>) {
    loop {
        let failed = matches!(&*shutdown.borrow_and_update(), Some(reason) if reason.is_failure());
        if failed {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// A bounded window of the most recent sequence numbers
struct RecentSeqNos {
    seq_nos: FxHashSet<u32>,
    order: VecDeque<u32>,
    capacity: usize,
}

impl RecentSeqNos {
    fn new(capacity: usize) -> RecentSeqNos {
        RecentSeqNos {
            seq_nos: FxHashSet::default(),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// false if the sequence number is in the window already
    fn insert(&mut self, seq_no: u32) -> bool {
        if !self.seq_nos.insert(seq_no) {
            return false;
        }
        self.order.push_back(seq_no);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seq_nos.remove(&oldest);
            }
        }
        true
    }
}
