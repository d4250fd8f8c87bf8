pub mod ipc;

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::UnixListener;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::addr::{ConnectionId, RdtpAddr};
use crate::config::RdtpConfig;
use crate::error::RdtpError;
use crate::listener::Listener;
use crate::multiplexer::Multiplexer;
use crate::network::{run_receiver, Network, PacketSink};
use crate::service::ipc::{ClientMessage, ClientMessageType, ServiceError, ServiceMessage};
use crate::socket::Socket;

/// The RDTP service of one host: it owns the multiplexer for all of the host's connections and
///  serves local applications over the IPC protocol (see [ipc]).
///
/// Each IPC client stream carries exactly one request:
/// * `DIAL` opens a connection from a random local port, and the stream then becomes the
///    connection's application side
/// * `LISTEN` registers a listener and sends a `NOTIFY` for every connection request on its
///    port until the client disconnects
/// * `ACCEPT` (after a `NOTIFY`) completes the connection request, the stream then becomes the
///    connection's application side
pub struct RdtpService<N: Network> {
    config: Arc<RdtpConfig>,
    network: Arc<N>,
    multiplexer: Arc<Multiplexer>,
    local_ip: Ipv4Addr,
}

impl<N: Network> RdtpService<N> {
    pub fn new(config: Arc<RdtpConfig>, network: Arc<N>, local_ip: Ipv4Addr) -> anyhow::Result<Arc<RdtpService<N>>> {
        config.validate()?;
        if local_ip.is_unspecified() {
            bail!("the service needs a concrete local IP address");
        }

        Ok(Arc::new(RdtpService {
            config,
            network,
            multiplexer: Arc::new(Multiplexer::new()),
            local_ip,
        }))
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.multiplexer
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    /// Spawns the task routing packets from the network to this service's connections
    pub fn spawn_receiver(&self) -> JoinHandle<()> {
        tokio::spawn(run_receiver(self.network.clone(), self.multiplexer.clone()))
    }

    /// Binds the configured IPC socket path (replacing a stale socket file) and serves clients
    pub async fn bind_and_serve(self: Arc<Self>) -> anyhow::Result<()> {
        let path = self.config.service_socket_path.clone();
        if Path::new(&path).exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("could not remove stale socket file {}", path))?;
        }
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("could not bind IPC socket {}", path))?;
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> anyhow::Result<()> {
        info!("serving IPC clients on {:?}", listener.local_addr()?);

        loop {
            let (stream, _) = listener.accept().await?;
            let service = self.clone();
            tokio::spawn(async move {
                if let Err(e) = service.handle_client(stream).await {
                    warn!("client session failed: {:#}", e);
                }
            });
        }
    }

    /// Serves a single client request, returning when the request is done: for `DIAL` and
    ///  `ACCEPT` when the connection is closed, for `LISTEN` when the client disconnects.
    pub async fn handle_client<S>(&self, mut stream: S) -> anyhow::Result<()>
    where S: AsyncRead + AsyncWrite + Send + Unpin + 'static
    {
        let body = match ipc::read_frame(&mut stream).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                debug!("client disconnected without a request");
                return Ok(());
            }
            Err(e) => {
                let kind = match e.downcast_ref::<std::io::Error>() {
                    Some(io_err) if io_err.kind() == std::io::ErrorKind::UnexpectedEof => ServiceError::ConnClosedByClient,
                    _ => ServiceError::MalformedMessage,
                };
                reply_error(&mut stream, kind).await;
                return Err(e.context("could not read client request"));
            }
        };

        let request = match ClientMessage::decode(&body) {
            Ok(request) => request,
            Err(e) => {
                reply_error(&mut stream, e).await;
                bail!("rejected client request: {}", e);
            }
        };
        debug!("client request: {:?}", request);

        match request.kind {
            ClientMessageType::Dial => self.dial(stream, request.remote_addr).await,
            ClientMessageType::Listen => self.listen(stream, request.local_addr.port).await,
            ClientMessageType::Accept => self.accept(stream, request.local_addr, request.remote_addr).await,
        }
    }

    async fn dial<S>(&self, mut stream: S, remote: RdtpAddr) -> anyhow::Result<()>
    where S: AsyncRead + AsyncWrite + Send + Unpin + 'static
    {
        match self.register_dial_socket(remote).await {
            Ok(socket) => self.open_and_run(stream, socket, true).await,
            Err((kind, e)) => {
                reply_error(&mut stream, kind).await;
                Err(anyhow!(e).context(format!("could not dial {}", remote)))
            }
        }
    }

    /// Picks a random local port that is not in use for the remote endpoint yet
    async fn register_dial_socket(&self, remote: RdtpAddr) -> Result<Arc<Socket>, (ServiceError, RdtpError)> {
        for _ in 0..self.config.dial_port_attempts {
            let port = rand::thread_rng().gen_range(1..=u16::MAX);
            let id = ConnectionId::new(RdtpAddr::new(self.local_ip, port), remote);

            let socket = self.new_socket(id)
                .map_err(|e| (ServiceError::CreateSocketFail, e))?;

            match self.multiplexer.put(socket.clone()).await {
                Ok(()) => return Ok(socket),
                Err(RdtpError::AddressInUse(key)) => debug!("{} is in use, trying another local port", key),
                Err(e) => return Err((ServiceError::AttachSocketFail, e)),
            }
        }

        Err((ServiceError::AttachSocketFail, RdtpError::AddressInUse(format!("all attempted local ports for {}", remote))))
    }

    async fn accept<S>(&self, mut stream: S, local: RdtpAddr, remote: RdtpAddr) -> anyhow::Result<()>
    where S: AsyncRead + AsyncWrite + Send + Unpin + 'static
    {
        // listening clients need not know the host's address
        let local = if local.host.is_unspecified() {
            RdtpAddr::new(self.local_ip, local.port)
        }
        else {
            local
        };

        let socket = match self.new_socket(ConnectionId::new(local, remote)) {
            Ok(socket) => socket,
            Err(e) => {
                reply_error(&mut stream, ServiceError::CreateSocketFail).await;
                return Err(anyhow!(e).context("could not create socket"));
            }
        };
        if let Err(e) = self.multiplexer.put(socket.clone()).await {
            reply_error(&mut stream, ServiceError::AttachSocketFail).await;
            return Err(anyhow!(e).context("could not attach socket"));
        }

        self.open_and_run(stream, socket, false).await
    }

    fn new_socket(&self, id: ConnectionId) -> Result<Arc<Socket>, RdtpError> {
        let network: Arc<dyn PacketSink> = self.network.clone();
        Socket::for_connection(self.config.clone(), id, network)
    }

    /// Runs the handshake and then the connection for a registered socket, evicting it when
    ///  done
    async fn open_and_run<S>(&self, stream: S, socket: Arc<Socket>, active: bool) -> anyhow::Result<()>
    where S: AsyncRead + AsyncWrite + Send + Unpin + 'static
    {
        let id = socket.id();
        let result = self.do_open_and_run(stream, &socket, active).await;
        self.multiplexer.evict(&id).await;
        result.with_context(|| format!("connection {}", id))
    }

    async fn do_open_and_run<S>(&self, mut stream: S, socket: &Arc<Socket>, active: bool) -> anyhow::Result<()>
    where S: AsyncRead + AsyncWrite + Send + Unpin + 'static
    {
        let opened = if active {
            socket.connect().await
        }
        else {
            socket.accept().await
        };
        if let Err(e) = opened {
            reply_error(&mut stream, ServiceError::HandshakeFailed).await;
            return Err(anyhow!(e).context("handshake failed"));
        }

        if let Err(e) = ipc::write_message(&mut stream, &ServiceMessage::ok(socket.local_addr(), socket.remote_addr())).await {
            reply_error(&mut stream, ServiceError::CommunicationFailed).await;
            return Err(e.context("could not confirm the connection to the client"));
        }

        socket.run(stream).await?;
        Ok(())
    }

    async fn listen<S>(&self, mut stream: S, port: u16) -> anyhow::Result<()>
    where S: AsyncRead + AsyncWrite + Send + Unpin + 'static
    {
        if port == 0 {
            reply_error(&mut stream, ServiceError::AttachListenerFail).await;
            bail!("cannot listen on port 0");
        }

        let (listener, mut notifications) = Listener::new(port, self.config.listener_backlog);
        if let Err(e) = self.multiplexer.attach_listener(listener).await {
            reply_error(&mut stream, ServiceError::AttachListenerFail).await;
            return Err(anyhow!(e).context("could not attach listener"));
        }

        let local = RdtpAddr::new(self.local_ip, port);
        let result = forward_notifications(&mut stream, local, &mut notifications).await;
        self.multiplexer.detach_listener(port).await;
        result
    }
}

async fn forward_notifications<S>(stream: &mut S, local: RdtpAddr, notifications: &mut mpsc::Receiver<RdtpAddr>) -> anyhow::Result<()>
where S: AsyncRead + AsyncWrite + Unpin
{
    ipc::write_message(stream, &ServiceMessage::ok(local, RdtpAddr::default())).await?;

    let mut probe = [0u8; 1];
    loop {
        select! {
            read = stream.read(&mut probe) => match read {
                Ok(0) => {
                    debug!("listening client for {} disconnected", local);
                    return Ok(());
                }
                Ok(_) => debug!("ignoring data from listening client for {}", local),
                Err(e) => return Err(anyhow!(e).context("listening client failed")),
            },
            remote = notifications.recv() => match remote {
                Some(remote) => ipc::write_message(stream, &ServiceMessage::notify(local, remote)).await?,
                None => return Ok(()),
            },
        }
    }
}

async fn reply_error<W: AsyncWrite + Unpin>(stream: &mut W, error: ServiceError) {
    if let Err(e) = ipc::write_message(stream, &ServiceMessage::error(error)).await {
        debug!("could not report {} to client: {}", error, e);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::time::{sleep, timeout};
    use crate::network::memory::{MemoryNetwork, MemoryWire};
    use crate::service::ipc::{read_service_message, write_message, ServiceMessageType};
    use super::*;

    const HOST_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const HOST_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn test_config() -> Arc<RdtpConfig> {
        Arc::new(RdtpConfig {
            handshake_timeout: Duration::from_millis(500),
            ack_wait: Duration::from_millis(50),
            chunk_size: 16,
            ..RdtpConfig::default()
        })
    }

    fn host(wire: &Arc<MemoryWire>, ip: Ipv4Addr) -> Arc<RdtpService<MemoryNetwork>> {
        let service = RdtpService::new(test_config(), Arc::new(wire.attach(ip)), ip).unwrap();
        service.spawn_receiver();
        service
    }

    fn connect_client(service: &Arc<RdtpService<MemoryNetwork>>) -> DuplexStream {
        let (client, server) = duplex(64 * 1024);
        let service = service.clone();
        tokio::spawn(async move { service.handle_client(server).await });
        client
    }

    async fn request(service: &Arc<RdtpService<MemoryNetwork>>, kind: ClientMessageType, local: RdtpAddr, remote: RdtpAddr) -> (DuplexStream, ServiceMessage) {
        let mut client = connect_client(service);
        write_message(&mut client, &ClientMessage::new(kind, local, remote)).await.unwrap();
        let response = read_service_message(&mut client).await.unwrap().unwrap();
        (client, response)
    }

    async fn wait_until_idle(service: &Arc<RdtpService<MemoryNetwork>>) {
        timeout(Duration::from_secs(2), async {
            while service.multiplexer().socket_count().await > 0 || service.multiplexer().listener_count().await > 0 {
                sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();
    }

    /// Sets up a connection from host A to port 80 on host B, returning the dialing client's
    ///  and the accepting client's streams
    async fn establish(a: &Arc<RdtpService<MemoryNetwork>>, b: &Arc<RdtpService<MemoryNetwork>>) -> (DuplexStream, DuplexStream, DuplexStream) {
        let (mut listening, listen_ok) = request(b, ClientMessageType::Listen, RdtpAddr::new(Ipv4Addr::UNSPECIFIED, 80), RdtpAddr::default()).await;
        assert_eq!(listen_ok.kind, ServiceMessageType::Ok);
        assert_eq!(listen_ok.local_addr, RdtpAddr::new(HOST_B, 80));

        let mut dialing = connect_client(a);
        write_message(&mut dialing, &ClientMessage::new(ClientMessageType::Dial, RdtpAddr::default(), RdtpAddr::new(HOST_B, 80))).await.unwrap();

        let notification = read_service_message(&mut listening).await.unwrap().unwrap();
        assert_eq!(notification.kind, ServiceMessageType::Notify);
        assert_eq!(notification.remote_addr.host, HOST_A);

        let (accepting, accept_ok) = request(b, ClientMessageType::Accept, notification.local_addr, notification.remote_addr).await;
        assert_eq!(accept_ok.kind, ServiceMessageType::Ok);
        assert_eq!(accept_ok.local_addr, RdtpAddr::new(HOST_B, 80));
        assert_eq!(accept_ok.remote_addr, notification.remote_addr);

        let dial_ok = read_service_message(&mut dialing).await.unwrap().unwrap();
        assert_eq!(dial_ok.kind, ServiceMessageType::Ok);
        assert_eq!(dial_ok.local_addr, notification.remote_addr);
        assert_eq!(dial_ok.remote_addr, RdtpAddr::new(HOST_B, 80));

        (listening, dialing, accepting)
    }

    #[tokio::test]
    async fn test_dial_listen_accept_transfer_close() {
        let wire = MemoryWire::new();
        let a = host(&wire, HOST_A);
        let b = host(&wire, HOST_B);

        let (listening, mut dialing, mut accepting) = establish(&a, &b).await;
        assert_eq!(a.multiplexer().socket_count().await, 1);
        assert_eq!(b.multiplexer().socket_count().await, 1);

        let request = b"GET / HTTP/1.0\r\n\r\n";
        dialing.write_all(request).await.unwrap();
        let mut buf = vec![0u8; request.len()];
        accepting.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, request);

        accepting.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        dialing.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // closing the dialing side tears down the connection on both hosts
        dialing.shutdown().await.unwrap();
        let mut rest = Vec::new();
        accepting.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        drop(listening);
        wait_until_idle(&a).await;
        wait_until_idle(&b).await;
    }

    #[tokio::test]
    async fn test_lost_packet_is_retransmitted() {
        let wire = MemoryWire::new();
        let a = host(&wire, HOST_A);
        let b = host(&wire, HOST_B);
        let (_listening, mut dialing, mut accepting) = establish(&a, &b).await;

        let mut dropped = false;
        wire.set_drop_filter(move |p| {
            if !dropped && !p.payload.is_empty() {
                dropped = true;
                return true;
            }
            false
        });

        // a single chunk, since packets are not resequenced
        dialing.write_all(b"survives loss").await.unwrap();
        let mut buf = vec![0u8; 13];
        accepting.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"survives loss");
    }

    #[tokio::test]
    async fn test_dial_without_listener() {
        let wire = MemoryWire::new();
        let a = host(&wire, HOST_A);
        let _b = host(&wire, HOST_B);

        let (_dialing, response) = request(&a, ClientMessageType::Dial, RdtpAddr::default(), RdtpAddr::new(HOST_B, 80)).await;
        assert_eq!(response.kind, ServiceMessageType::Error);
        assert_eq!(response.error, Some(ServiceError::HandshakeFailed));
        wait_until_idle(&a).await;
    }

    #[tokio::test]
    async fn test_dial_invalid_remote() {
        let wire = MemoryWire::new();
        let a = host(&wire, HOST_A);

        let (_dialing, response) = request(&a, ClientMessageType::Dial, RdtpAddr::default(), RdtpAddr::default()).await;
        assert_eq!(response.error, Some(ServiceError::CreateSocketFail));
    }

    #[tokio::test]
    async fn test_listen_twice() {
        let wire = MemoryWire::new();
        let b = host(&wire, HOST_B);

        let (_first, response) = request(&b, ClientMessageType::Listen, RdtpAddr::new(HOST_B, 80), RdtpAddr::default()).await;
        assert_eq!(response.kind, ServiceMessageType::Ok);

        let (_second, response) = request(&b, ClientMessageType::Listen, RdtpAddr::new(HOST_B, 80), RdtpAddr::default()).await;
        assert_eq!(response.error, Some(ServiceError::AttachListenerFail));
        assert_eq!(b.multiplexer().listener_count().await, 1);
    }

    #[tokio::test]
    async fn test_accept_twice() {
        let wire = MemoryWire::new();
        let b = host(&wire, HOST_B);
        let remote = RdtpAddr::new(HOST_A, 5000);

        // nobody answers, so the first ACCEPT keeps the 4-tuple registered until it times out
        let mut first = connect_client(&b);
        write_message(&mut first, &ClientMessage::new(ClientMessageType::Accept, RdtpAddr::new(HOST_B, 80), remote)).await.unwrap();
        timeout(Duration::from_secs(1), async {
            while b.multiplexer().socket_count().await == 0 {
                sleep(Duration::from_millis(1)).await;
            }
        }).await.unwrap();

        let (_second, response) = request(&b, ClientMessageType::Accept, RdtpAddr::new(HOST_B, 80), remote).await;
        assert_eq!(response.error, Some(ServiceError::AttachSocketFail));

        let response = read_service_message(&mut first).await.unwrap().unwrap();
        assert_eq!(response.error, Some(ServiceError::HandshakeFailed));
    }

    #[rstest::rstest]
    #[case::not_json(b"hello".as_slice(), ServiceError::MalformedMessage)]
    #[case::unknown_type(br#"{"type":"CONNECT"}"#.as_slice(), ServiceError::InvalidMessageType)]
    fn test_bad_request(#[case] body: &[u8], #[case] expected: ServiceError) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let wire = MemoryWire::new();
            let a = host(&wire, HOST_A);

            let mut client = connect_client(&a);
            client.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
            client.write_all(body).await.unwrap();

            let response = read_service_message(&mut client).await.unwrap().unwrap();
            assert_eq!(response.kind, ServiceMessageType::Error);
            assert_eq!(response.error, Some(expected));
        });
    }

    #[rstest::rstest]
    #[case::in_length_prefix(&[0, 0])]
    #[case::in_body(&[0, 0, 0, 10, b'{', b'}'])]
    fn test_client_closes_mid_request(#[case] sent: &'static [u8]) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let wire = MemoryWire::new();
            let a = host(&wire, HOST_A);

            let mut client = connect_client(&a);
            client.write_all(sent).await.unwrap();
            client.shutdown().await.unwrap();

            let response = read_service_message(&mut client).await.unwrap().unwrap();
            assert_eq!(response.error, Some(ServiceError::ConnClosedByClient));
        });
    }

    #[test]
    fn test_new_requires_local_ip() {
        let wire = MemoryWire::new();
        assert!(RdtpService::new(test_config(), Arc::new(wire.attach(HOST_A)), Ipv4Addr::UNSPECIFIED).is_err());
    }
}
