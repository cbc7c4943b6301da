//! Peer-side dialer
//!
//! The dialer owns the real socket behind one logical connection on the
//! cluster side of the tunnel: it opens the socket on demand (or adopts a
//! pre-existing one), pumps bytes between the socket and the tunnel stream,
//! and negotiates lifecycle with the workstation through control frames.
//!
//! # State machine
//!
//! `NotConnected` is the initial state when no local socket exists yet.
//! `HalfConnected` means a local socket pre-exists and the remote end must
//! still confirm with `CONNECT_OK`. `Connected` means both ends are wired.
//! `Closed` is terminal; the transition into it runs the release exactly
//! once no matter how many paths race to close.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::TunnelConfig;
use crate::connid::ConnId;
use crate::handler::{send_control, Activity};
use crate::pool::Release;
use crate::proto::{ControlCode, ControlMessage, Message};
use crate::transport::{send_message, Transport};

const NOT_CONNECTED: u8 = 0;
const HALF_CONNECTED: u8 = 1;
const CONNECTED: u8 = 2;
const CLOSED: u8 = 3;

const READ_BUF_SIZE: usize = 0x8000;

/// Dialer tunables, extracted from [`TunnelConfig`]
#[derive(Debug, Clone, Copy)]
pub struct DialerConfig {
    /// Socket dial timeout
    pub dial_timeout: Duration,
    /// Rolling idle deadline for socket reads
    pub conn_ttl: Duration,
    /// Inbound payload queue capacity
    pub queue_capacity: usize,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(30),
            conn_ttl: Duration::from_secs(300),
            queue_capacity: 10,
        }
    }
}

impl From<&TunnelConfig> for DialerConfig {
    fn from(config: &TunnelConfig) -> Self {
        Self {
            dial_timeout: config.dial_timeout(),
            conn_ttl: config.conn_ttl(),
            queue_capacity: config.handler_queue,
        }
    }
}

struct Inner {
    id: ConnId,
    transport: Arc<dyn Transport>,
    release: Release,
    config: DialerConfig,
    state: AtomicU8,
    queue_tx: mpsc::Sender<Bytes>,
    queue_rx: parking_lot::Mutex<Option<mpsc::Receiver<Bytes>>>,
    // Pre-existing local socket awaiting CONNECT_OK (half-connected only)
    pending: parking_lot::Mutex<Option<TcpStream>>,
    activity: Activity,
    cancel: CancellationToken,
}

/// Handler that dials and drives the real socket for one connection
#[derive(Clone)]
pub struct Dialer {
    inner: Arc<Inner>,
}

impl Dialer {
    /// Dialer with no local socket yet; the socket opens on the first
    /// `CONNECT`, or eagerly for UDP
    #[must_use]
    pub fn new(
        id: ConnId,
        transport: Arc<dyn Transport>,
        release: Release,
        cancel: CancellationToken,
        config: DialerConfig,
    ) -> Self {
        Self::with_state(id, transport, release, cancel, config, NOT_CONNECTED, None)
    }

    /// Dialer adopting a pre-existing local TCP socket; the remote end must
    /// still confirm with `CONNECT_OK` before the pumps start
    #[must_use]
    pub fn from_stream(
        id: ConnId,
        transport: Arc<dyn Transport>,
        release: Release,
        cancel: CancellationToken,
        config: DialerConfig,
        stream: TcpStream,
    ) -> Self {
        Self::with_state(
            id,
            transport,
            release,
            cancel,
            config,
            HALF_CONNECTED,
            Some(stream),
        )
    }

    fn with_state(
        id: ConnId,
        transport: Arc<dyn Transport>,
        release: Release,
        cancel: CancellationToken,
        config: DialerConfig,
        state: u8,
        pending: Option<TcpStream>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                id,
                transport,
                release,
                config,
                state: AtomicU8::new(state),
                queue_tx,
                queue_rx: parking_lot::Mutex::new(Some(queue_rx)),
                pending: parking_lot::Mutex::new(pending),
                activity: Activity::new(),
                cancel,
            }),
        }
    }

    /// Connection this dialer serves
    #[must_use]
    pub fn id(&self) -> ConnId {
        self.inner.id
    }

    /// Initial actions when the dialer enters the pool
    ///
    /// UDP has no connect handshake on the wire, so the local socket opens
    /// eagerly. A half-connected dialer announces its socket to the remote
    /// end and waits for confirmation.
    pub async fn start(&self) {
        match self.inner.state.load(Ordering::Acquire) {
            NOT_CONNECTED if self.inner.id.is_udp() => {
                if self.open().await == ControlCode::ConnectReject {
                    self.close().await;
                }
            }
            HALF_CONNECTED => {
                send_control(&self.inner.transport, self.inner.id, ControlCode::Connect).await;
            }
            _ => {}
        }
    }

    /// Apply a lifecycle control frame from the remote end
    pub async fn handle_control(&self, cm: ControlMessage) {
        trace!(id = %self.inner.id, code = %cm.code, "control");
        match cm.code {
            ControlCode::Connect => {
                let code = self.open().await;
                send_control(&self.inner.transport, self.inner.id, code).await;
                if code == ControlCode::ConnectReject {
                    self.close().await;
                }
            }
            ControlCode::ConnectOk => {
                let stream = self.inner.pending.lock().take();
                if let Some(stream) = stream {
                    if self
                        .inner
                        .state
                        .compare_exchange(
                            HALF_CONNECTED,
                            CONNECTED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.spawn_tcp_pumps(stream);
                    }
                } else {
                    debug!(id = %self.inner.id, "CONNECT_OK with no pending socket");
                }
            }
            ControlCode::ConnectReject => {
                debug!(id = %self.inner.id, "remote end rejected the connection");
                self.close().await;
            }
            ControlCode::Disconnect => {
                self.close().await;
                send_control(&self.inner.transport, self.inner.id, ControlCode::DisconnectOk)
                    .await;
            }
            ControlCode::DisconnectOk | ControlCode::ReadClosed | ControlCode::WriteClosed => {
                debug!(id = %self.inner.id, code = %cm.code, "dropping control");
            }
        }
    }

    /// Enqueue a payload frame from the tunnel for the socket write pump
    pub async fn handle_message(&self, data: Bytes) {
        tokio::select! {
            () = self.inner.cancel.cancelled() => {}
            res = self.inner.queue_tx.send(data) => {
                if res.is_err() {
                    debug!(id = %self.inner.id, "payload after close, dropping");
                }
            }
        }
    }

    /// Dialers live on the peer side; captured packets never reach them
    pub fn handle_packet(&self, _payload: &Bytes) {
        warn!(id = %self.inner.id, "dialer received a captured packet, dropping");
    }

    /// Close the socket and unregister; safe to call from any state, any
    /// number of times
    pub async fn close(&self) {
        let prev = self.inner.state.swap(CLOSED, Ordering::AcqRel);
        if prev == CLOSED {
            return;
        }
        debug!(id = %self.inner.id, "closing");
        self.inner.cancel.cancel();
        self.inner.pending.lock().take();
        self.inner.release.release();
    }

    /// Instant of the last byte moved in either direction
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.inner.activity.last()
    }

    fn is_connected(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CONNECTED
    }

    /// Open the local socket if not already open, returning the control
    /// code to answer a `CONNECT` with
    async fn open(&self) -> ControlCode {
        if self
            .inner
            .state
            .compare_exchange(NOT_CONNECTED, CONNECTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Connect retry from the remote end; the socket is already
            // open or opening.
            return ControlCode::ConnectOk;
        }
        let dst = self.inner.id.destination();
        debug!(id = %self.inner.id, "dialing {dst}");
        let dialed = if self.inner.id.is_tcp() {
            match timeout(self.inner.config.dial_timeout, TcpStream::connect(dst)).await {
                Ok(Ok(stream)) => {
                    self.spawn_tcp_pumps(stream);
                    Ok(())
                }
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("dial timeout".to_string()),
            }
        } else {
            let bind = if dst.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            match UdpSocket::bind(bind).await {
                Ok(socket) => match socket.connect(dst).await {
                    Ok(()) => {
                        self.spawn_udp_pumps(Arc::new(socket));
                        Ok(())
                    }
                    Err(e) => Err(e.to_string()),
                },
                Err(e) => Err(e.to_string()),
            }
        };
        match dialed {
            Ok(()) => ControlCode::ConnectOk,
            Err(e) => {
                warn!(id = %self.inner.id, "failed to establish connection: {e}");
                ControlCode::ConnectReject
            }
        }
    }

    fn spawn_tcp_pumps(&self, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let dialer = self.clone();
        tokio::spawn(async move { dialer.tcp_read_pump(read_half).await });
        if let Some(queue_rx) = self.inner.queue_rx.lock().take() {
            let dialer = self.clone();
            tokio::spawn(async move { dialer.tcp_write_pump(write_half, queue_rx).await });
        }
    }

    fn spawn_udp_pumps(&self, socket: Arc<UdpSocket>) {
        let dialer = self.clone();
        let read_socket = Arc::clone(&socket);
        tokio::spawn(async move { dialer.udp_read_pump(read_socket).await });
        if let Some(queue_rx) = self.inner.queue_rx.lock().take() {
            let dialer = self.clone();
            tokio::spawn(async move { dialer.udp_write_pump(socket, queue_rx).await });
        }
    }

    /// Socket-to-tunnel pump for TCP; the idle deadline rolls forward on
    /// every successful read
    async fn tcp_read_pump(self, mut read_half: OwnedReadHalf) {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let read = tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                res = timeout(self.inner.config.conn_ttl, read_half.read(&mut buf)) => res,
            };
            match read {
                Err(_) => {
                    debug!(id = %self.inner.id, "idle too long, closing");
                    break;
                }
                Ok(Ok(0)) => {
                    if self.is_connected() {
                        send_control(&self.inner.transport, self.inner.id, ControlCode::ReadClosed)
                            .await;
                    }
                    break;
                }
                Ok(Ok(n)) => {
                    self.inner.activity.touch();
                    let msg = Message::payload(self.inner.id, Bytes::copy_from_slice(&buf[..n]));
                    if send_message(self.inner.transport.as_ref(), &msg)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    if self.is_connected() {
                        warn!(id = %self.inner.id, "socket read failed: {e}");
                        send_control(&self.inner.transport, self.inner.id, ControlCode::ReadClosed)
                            .await;
                    }
                    break;
                }
            }
        }
        self.close().await;
    }

    /// Tunnel-to-socket pump for TCP
    async fn tcp_write_pump(self, mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
        loop {
            let data = tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                data = rx.recv() => match data {
                    Some(data) => data,
                    None => break,
                },
            };
            self.inner.activity.touch();
            if let Err(e) = write_half.write_all(&data).await {
                if self.is_connected() {
                    warn!(id = %self.inner.id, "socket write failed: {e}");
                    send_control(&self.inner.transport, self.inner.id, ControlCode::WriteClosed)
                        .await;
                }
                break;
            }
        }
        self.close().await;
    }

    /// Socket-to-tunnel pump for UDP; read failures close silently since
    /// UDP has no read-closed notion on the wire
    async fn udp_read_pump(self, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let read = tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                res = timeout(self.inner.config.conn_ttl, socket.recv(&mut buf)) => res,
            };
            match read {
                Err(_) => {
                    debug!(id = %self.inner.id, "idle too long, closing");
                    break;
                }
                Ok(Ok(n)) => {
                    self.inner.activity.touch();
                    let msg = Message::payload(self.inner.id, Bytes::copy_from_slice(&buf[..n]));
                    if send_message(self.inner.transport.as_ref(), &msg)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    debug!(id = %self.inner.id, "socket recv failed: {e}");
                    break;
                }
            }
        }
        self.close().await;
    }

    /// Tunnel-to-socket pump for UDP
    async fn udp_write_pump(self, socket: Arc<UdpSocket>, mut rx: mpsc::Receiver<Bytes>) {
        loop {
            let data = tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                data = rx.recv() => match data {
                    Some(data) => data,
                    None => break,
                },
            };
            self.inner.activity.touch();
            if let Err(e) = socket.send(&data).await {
                debug!(id = %self.inner.id, "socket send failed: {e}");
                break;
            }
        }
        self.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connid::{PROTO_TCP, PROTO_UDP};
    use crate::pool::Pool;
    use crate::transport::ChannelTransport;

    async fn recv_message(transport: &ChannelTransport) -> Message {
        let frame = transport.recv().await.unwrap().unwrap();
        Message::decode(&frame).unwrap()
    }

    async fn pooled_dialer(
        pool: &Pool,
        id: ConnId,
        transport: Arc<dyn Transport>,
        config: DialerConfig,
    ) -> Dialer {
        let handler = pool
            .get(id, |release| async move {
                Ok(crate::handler::Handler::Dialer(Dialer::new(
                    id,
                    transport,
                    release,
                    CancellationToken::new(),
                    config,
                )))
            })
            .await
            .unwrap();
        match handler {
            crate::handler::Handler::Dialer(d) => d,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_tcp_connect_dial_and_relay() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
            socket
        });

        let id = ConnId::new(PROTO_TCP, "10.0.0.1".parse().unwrap(), dst.ip(), 40001, dst.port());
        let (local, remote) = ChannelTransport::pair(16);
        let pool = Pool::new();
        let dialer = pooled_dialer(&pool, id, Arc::new(local), DialerConfig::default()).await;

        dialer
            .handle_control(ControlMessage {
                id,
                code: ControlCode::Connect,
                extra: Bytes::new(),
            })
            .await;
        match recv_message(&remote).await {
            Message::Control(cm) => assert_eq!(cm.code, ControlCode::ConnectOk),
            other => panic!("expected CONNECT_OK, got {other}"),
        }

        dialer.handle_message(Bytes::from_static(b"echo me")).await;
        match recv_message(&remote).await {
            Message::Payload { data, .. } => assert_eq!(&data[..], b"echo me"),
            other => panic!("expected payload, got {other}"),
        }

        let _socket = accept.await.unwrap();
        dialer.close().await;
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_tcp_dial_failure_rejects_and_releases() {
        // Port 1 on localhost refuses connections.
        let id = ConnId::new(
            PROTO_TCP,
            "10.0.0.1".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
            40002,
            1,
        );
        let (local, remote) = ChannelTransport::pair(16);
        let pool = Pool::new();
        let dialer = pooled_dialer(&pool, id, Arc::new(local), DialerConfig::default()).await;

        dialer
            .handle_control(ControlMessage {
                id,
                code: ControlCode::Connect,
                extra: Bytes::new(),
            })
            .await;
        match recv_message(&remote).await {
            Message::Control(cm) => assert_eq!(cm.code, ControlCode::ConnectReject),
            other => panic!("expected CONNECT_REJECT, got {other}"),
        }
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_udp_eager_open_and_relay() {
        let resolver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dst = resolver.local_addr().unwrap();
        let id = ConnId::new(PROTO_UDP, "10.0.0.1".parse().unwrap(), dst.ip(), 40003, dst.port());

        let (local, remote) = ChannelTransport::pair(16);
        let pool = Pool::new();
        // start() runs inside get and opens the socket for UDP.
        let dialer = pooled_dialer(&pool, id, Arc::new(local), DialerConfig::default()).await;

        dialer.handle_message(Bytes::from_static(b"query")).await;
        let mut buf = [0u8; 16];
        let (n, from) = resolver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"query");
        resolver.send_to(b"answer", from).await.unwrap();

        match recv_message(&remote).await {
            Message::Payload { data, .. } => assert_eq!(&data[..], b"answer"),
            other => panic!("expected payload, got {other}"),
        }
        dialer.close().await;
    }

    #[tokio::test]
    async fn test_disconnect_answers_and_releases() {
        let resolver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dst = resolver.local_addr().unwrap();
        let id = ConnId::new(PROTO_UDP, "10.0.0.1".parse().unwrap(), dst.ip(), 40004, dst.port());

        let (local, remote) = ChannelTransport::pair(16);
        let pool = Pool::new();
        let dialer = pooled_dialer(&pool, id, Arc::new(local), DialerConfig::default()).await;

        dialer
            .handle_control(ControlMessage {
                id,
                code: ControlCode::Disconnect,
                extra: Bytes::new(),
            })
            .await;
        match recv_message(&remote).await {
            Message::Control(cm) => assert_eq!(cm.code, ControlCode::DisconnectOk),
            other => panic!("expected DISCONNECT_OK, got {other}"),
        }
        assert!(pool.is_empty());

        // Closing again is a no-op.
        dialer.close().await;
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_half_connected_start_sends_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        drop(client);

        let id = ConnId::new(PROTO_TCP, addr.ip(), "10.0.0.9".parse().unwrap(), addr.port(), 8080);
        let (local, remote) = ChannelTransport::pair(16);
        let pool = Pool::new();
        let handler = pool
            .get(id, |release| async move {
                Ok(crate::handler::Handler::Dialer(Dialer::from_stream(
                    id,
                    Arc::new(local),
                    release,
                    CancellationToken::new(),
                    DialerConfig::default(),
                    server,
                )))
            })
            .await
            .unwrap();

        match recv_message(&remote).await {
            Message::Control(cm) => assert_eq!(cm.code, ControlCode::Connect),
            other => panic!("expected CONNECT, got {other}"),
        }
        handler.close().await;
        assert!(pool.is_empty());
    }
}
