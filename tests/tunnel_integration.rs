//! End-to-end tests wiring both tunnel ends together in one process: an
//! in-memory capture device on the router side, an in-memory transport in
//! the middle, and real sockets behind the peer-side dialers.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use smoltcp::wire::Ipv4Packet;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use tunlink::{
    dialer_factory, packet, send_message, ChannelDevice, ChannelTransport, ConnId, ControlCode,
    DialerConfig, Message, Pool, StreamMux, Transport, TunRouter, TunnelConfig, PROTO_TCP,
};

struct TestBed {
    router: TunRouter,
    inject: tokio::sync::mpsc::Sender<Vec<u8>>,
    drain: tokio::sync::mpsc::Receiver<Vec<u8>>,
    remote_end: Arc<ChannelTransport>,
    ready_tx: watch::Sender<bool>,
    run: tokio::task::JoinHandle<tunlink::Result<()>>,
}

/// Capture log output per test, filtered through `RUST_LOG`
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Router over in-memory device and transport, already running but gated
fn testbed(config: TunnelConfig) -> TestBed {
    init_tracing();
    let (device, inject, drain) = ChannelDevice::new(32);
    let (local_end, remote_end) = ChannelTransport::pair(32);
    let (ready_tx, ready_rx) = watch::channel(false);
    let router = TunRouter::new(device, Arc::new(local_end), config, ready_rx);
    let run = {
        let router = router.clone();
        tokio::spawn(async move { router.run().await })
    };
    TestBed {
        router,
        inject,
        drain,
        remote_end: Arc::new(remote_end),
        ready_tx,
        run,
    }
}

/// Spawn the peer side of the tunnel: a mux creating real-socket dialers
fn spawn_peer(remote_end: &Arc<ChannelTransport>) -> (Pool, CancellationToken) {
    init_tracing();
    let pool = Pool::new();
    let cancel = CancellationToken::new();
    let mux = StreamMux::new(
        Arc::clone(remote_end) as Arc<dyn Transport>,
        pool.clone(),
        dialer_factory(
            Arc::clone(remote_end) as Arc<dyn Transport>,
            DialerConfig::default(),
            cancel.clone(),
        ),
    );
    let loop_cancel = cancel.clone();
    tokio::spawn(async move { mux.read_loop(loop_cancel).await });
    (pool, cancel)
}

#[tokio::test]
async fn test_udp_round_trip_through_tunnel() {
    let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 128];
        let (n, from) = echo.recv_from(&mut buf).await.unwrap();
        echo.send_to(&buf[..n], from).await.unwrap();
    });

    let mut bed = testbed(TunnelConfig::default());
    let (_peer_pool, peer_cancel) = spawn_peer(&bed.remote_end);
    bed.ready_tx.send(true).unwrap();

    let src: SocketAddr = "10.0.0.1:4000".parse().unwrap();
    let query = packet::build_udp_packet(src, echo_addr, b"ping over the tunnel");
    bed.inject.send(query.to_vec()).await.unwrap();

    let reply = bed.drain.recv().await.unwrap();
    let header = packet::parse_ip_header(&reply).unwrap();
    assert_eq!(header.src, echo_addr.ip());
    assert_eq!(header.dst, src.ip());
    let l4 = &reply[header.header_len..];
    let (src_port, dst_port) = packet::udp_ports(l4).unwrap();
    assert_eq!(src_port, echo_addr.port());
    assert_eq!(dst_port, src.port());
    assert_eq!(packet::udp_payload(l4), b"ping over the tunnel");

    peer_cancel.cancel();
    bed.router.stop().await;
    bed.run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_tcp_round_trip_through_tunnel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 128];
        let n = socket.read(&mut buf).await.unwrap();
        socket.write_all(&buf[..n]).await.unwrap();
    });

    let mut bed = testbed(TunnelConfig::default());
    let (_peer_pool, peer_cancel) = spawn_peer(&bed.remote_end);
    bed.ready_tx.send(true).unwrap();

    let src: SocketAddr = "10.0.0.1:40001".parse().unwrap();
    let request = packet::build_tcp_packet(src, server_addr, b"GET / please");
    bed.inject.send(request.to_vec()).await.unwrap();

    let reply = bed.drain.recv().await.unwrap();
    let header = packet::parse_ip_header(&reply).unwrap();
    assert_eq!(header.protocol, PROTO_TCP);
    assert_eq!(header.src, server_addr.ip());
    assert_eq!(header.dst, src.ip());
    let l4 = &reply[header.header_len..];
    assert_eq!(packet::tcp_payload(l4), b"GET / please");

    peer_cancel.cancel();
    bed.router.stop().await;
    bed.run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_blocked_udp_port_answered_with_icmp() {
    let mut bed = testbed(TunnelConfig::default());
    bed.ready_tx.send(true).unwrap();

    let src: SocketAddr = "10.0.0.1:4000".parse().unwrap();
    let dst: SocketAddr = "10.0.0.7:137".parse().unwrap();
    let probe = packet::build_udp_packet(src, dst, b"netbios name probe");
    bed.inject.send(probe.to_vec()).await.unwrap();

    let reply = bed.drain.recv().await.unwrap();
    let header = packet::parse_ip_header(&reply).unwrap();
    // ICMP, from the refused destination back to the sender.
    assert_eq!(header.protocol, 1);
    assert_eq!(header.src, dst.ip());
    assert_eq!(header.dst, src.ip());
    // No connection entry was created for the refused packet.
    assert!(bed.router.pool().is_empty());

    bed.router.stop().await;
    bed.run.await.unwrap().unwrap();
}

/// Split a built IPv4 packet into valid on-the-wire fragments
fn make_fragments(pkt: &[u8], ident: u16, chunk: usize) -> Vec<Vec<u8>> {
    assert_eq!(chunk % 8, 0);
    let header = &pkt[..20];
    let payload = &pkt[20..];
    let mut frags = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + chunk).min(payload.len());
        let mut frag = Vec::with_capacity(20 + end - offset);
        frag.extend_from_slice(header);
        frag.extend_from_slice(&payload[offset..end]);
        {
            let mut p = Ipv4Packet::new_unchecked(&mut frag[..]);
            p.set_total_len((20 + end - offset) as u16);
            p.set_ident(ident);
            p.set_frag_offset(offset as u16);
            p.set_more_frags(end < payload.len());
            p.fill_checksum();
        }
        frags.push(frag);
        offset = end;
    }
    frags
}

#[tokio::test]
async fn test_fragmented_packet_reassembled_before_routing() {
    let bed = testbed(TunnelConfig::default());
    bed.ready_tx.send(true).unwrap();

    let src: SocketAddr = "10.0.0.1:4000".parse().unwrap();
    let dst: SocketAddr = "10.0.0.9:9999".parse().unwrap();
    let body: Vec<u8> = (0u16..56).map(|i| i as u8).collect();
    let full = packet::build_udp_packet(src, dst, &body);
    let frags = make_fragments(&full, 0x1234, 32);
    assert!(frags.len() > 1);

    for frag in frags {
        bed.inject.send(frag).await.unwrap();
    }

    // The router only emits one frame, carrying the whole datagram.
    let frame = bed.remote_end.recv().await.unwrap().unwrap();
    match Message::decode(&frame).unwrap() {
        Message::Payload { id, data } => {
            assert_eq!(id.source(), src);
            assert_eq!(id.destination(), dst);
            assert_eq!(&data[..], &body[..]);
        }
        other => panic!("expected payload frame, got {other}"),
    }

    bed.router.stop().await;
    bed.run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_peer_negotiation_with_real_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 128];
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            if socket.write_all(&buf[..n]).await.is_err() {
                return;
            }
        }
    });

    let (our_end, peer_end) = ChannelTransport::pair(32);
    let peer_end = Arc::new(peer_end);
    let (peer_pool, peer_cancel) = spawn_peer(&peer_end);

    let id = ConnId::new(
        PROTO_TCP,
        "10.0.0.1".parse().unwrap(),
        server_addr.ip(),
        40002,
        server_addr.port(),
    );
    send_message(&our_end, &Message::control(id, ControlCode::Connect))
        .await
        .unwrap();
    let frame = our_end.recv().await.unwrap().unwrap();
    assert_eq!(
        Message::decode(&frame).unwrap(),
        Message::control(id, ControlCode::ConnectOk)
    );

    send_message(&our_end, &Message::payload(id, Bytes::from_static(b"hello")))
        .await
        .unwrap();
    let frame = our_end.recv().await.unwrap().unwrap();
    assert_eq!(
        Message::decode(&frame).unwrap(),
        Message::payload(id, Bytes::from_static(b"hello"))
    );

    send_message(&our_end, &Message::control(id, ControlCode::Disconnect))
        .await
        .unwrap();
    let frame = our_end.recv().await.unwrap().unwrap();
    assert_eq!(
        Message::decode(&frame).unwrap(),
        Message::control(id, ControlCode::DisconnectOk)
    );
    assert!(peer_pool.is_empty());

    peer_cancel.cancel();
}

#[tokio::test]
async fn test_stop_drains_and_closes_device() {
    let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();

    let bed = testbed(TunnelConfig::default());
    let (peer_pool, peer_cancel) = spawn_peer(&bed.remote_end);
    bed.ready_tx.send(true).unwrap();

    let src: SocketAddr = "10.0.0.1:4000".parse().unwrap();
    let query = packet::build_udp_packet(src, echo_addr, b"traffic");
    bed.inject.send(query.to_vec()).await.unwrap();

    // Wait for the datagram to reach the echo socket so both pools hold an
    // entry before shutdown.
    let mut buf = [0u8; 32];
    let _ = echo.recv_from(&mut buf).await.unwrap();
    assert!(!bed.router.pool().is_empty());

    bed.router.stop().await;
    assert!(bed.router.pool().is_empty());
    bed.run.await.unwrap().unwrap();

    // A second stop is a no-op.
    bed.router.stop().await;
    peer_cancel.cancel();
    drop(peer_pool);
}
