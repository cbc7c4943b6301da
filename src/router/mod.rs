//! Packet router
//!
//! The router sits between the capture device and the tunnel stream. A
//! single reader classifies every captured packet and routes it to a pooled
//! connection handler; a single writer drains the queue of packets the
//! handlers want injected back into the device. Frames arriving from the
//! tunnel are demultiplexed by a [`StreamMux`] sharing the same pool.
//!
//! Refused traffic is answered with ICMP so local applications fail fast:
//! oversized packets, destinations with a zero host part, administratively
//! blocked UDP ports, and L4 protocols the tunnel does not carry.

pub mod fragment;
pub mod icmp;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::TunnelConfig;
use crate::connid::{ConnId, PROTO_TCP, PROTO_UDP};
use crate::device::TunDevice;
use crate::error::{Result, RouterError, TunnelError};
use crate::handler::{DnsInterceptor, Handler, TcpHandler, UdpHandler};
use crate::mux::{HandlerFactory, StreamMux};
use crate::packet::{self, IpHeader};
use crate::pool::{Pool, Release};
use crate::subnet::SubnetRegistry;

use fragment::FragmentMap;
use icmp::UnreachableReason;

const PROTO_ICMP: u8 = 1;
const PROTO_ICMPV6: u8 = 58;

const READ_BUF_SIZE: usize = 0x10000;

const RUNNING: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

struct RouterInner {
    device: Arc<dyn TunDevice>,
    transport: Arc<dyn crate::transport::Transport>,
    pool: Pool,
    to_device: mpsc::Sender<Bytes>,
    to_device_rx: parking_lot::Mutex<Option<mpsc::Receiver<Bytes>>>,
    fragments: parking_lot::Mutex<FragmentMap>,
    registry: Mutex<SubnetRegistry>,
    blocked_udp_ports: HashSet<u16>,
    config: TunnelConfig,
    state: AtomicU8,
    cancel: CancellationToken,
    ready: watch::Receiver<bool>,
}

/// Router for one capture device and one tunnel stream
#[derive(Clone)]
pub struct TunRouter {
    inner: Arc<RouterInner>,
}

impl TunRouter {
    /// Wire a router to its device and transport
    ///
    /// Traffic does not move until `ready` turns true; packets captured
    /// before that are not read at all, so nothing is silently dropped
    /// while the peer session is still being negotiated.
    #[must_use]
    pub fn new(
        device: Arc<dyn TunDevice>,
        transport: Arc<dyn crate::transport::Transport>,
        config: TunnelConfig,
        ready: watch::Receiver<bool>,
    ) -> Self {
        let (to_device, to_device_rx) = mpsc::channel(config.device_queue);
        let fragments = FragmentMap::new(config.fragment_ttl());
        let blocked_udp_ports = config.blocked_udp_ports.iter().copied().collect();
        Self {
            inner: Arc::new(RouterInner {
                device,
                transport,
                pool: Pool::new(),
                to_device,
                to_device_rx: parking_lot::Mutex::new(Some(to_device_rx)),
                fragments: parking_lot::Mutex::new(fragments),
                registry: Mutex::new(SubnetRegistry::new()),
                blocked_udp_ports,
                config,
                state: AtomicU8::new(RUNNING),
                cancel: CancellationToken::new(),
                ready,
            }),
        }
    }

    /// The router's connection pool
    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    /// Run the device loops and the stream demultiplexer until shutdown
    ///
    /// Call at most once. Returns after [`TunRouter::stop`], an orderly end
    /// of the tunnel stream, or a fatal device/transport failure; any one
    /// loop failing cancels the others before this returns.
    ///
    /// # Errors
    ///
    /// Returns the first fatal device or transport error.
    pub async fn run(&self) -> Result<()> {
        info!("router starting");
        let writer = tokio::spawn(write_loop(Arc::clone(&self.inner)));
        let factory = virtual_factory(Arc::clone(&self.inner));
        let streamer = tokio::spawn(stream_loop(Arc::clone(&self.inner), factory));
        let reaper = self.inner.pool.spawn_reaper(
            self.inner.config.conn_ttl(),
            self.inner.config.reap_interval(),
            self.inner.cancel.child_token(),
        );

        let read_result = device_loop(Arc::clone(&self.inner)).await;
        self.inner.cancel.cancel();
        let stream_result = streamer.await.unwrap_or(Ok(()));
        let write_result = writer.await.unwrap_or(Ok(()));
        let _ = reaper.await;
        info!("router finished");
        read_result.and(stream_result).and(write_result)
    }

    /// Drain and shut down; idempotent
    ///
    /// Open connections get `drain_timeout` to close cleanly before the
    /// loops are cancelled and the device is closed.
    pub async fn stop(&self) {
        if self
            .inner
            .state
            .compare_exchange(RUNNING, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!("router stopping");
        let drained = timeout(self.inner.config.drain_timeout(), async {
            self.inner.pool.close_all().await;
            while !self.inner.pool.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = self.inner.pool.len(),
                "drain timeout reached, closing anyway"
            );
        }
        self.inner.state.store(CLOSED, Ordering::Release);
        self.inner.cancel.cancel();
        self.inner.device.close();
    }

    /// Mark `ip` as worth routing into the tunnel; returns whether it was
    /// new. Takes effect on the next [`TunRouter::flush_routes`].
    pub async fn add_route(&self, ip: IpAddr) -> bool {
        self.inner.registry.lock().await.add(ip)
    }

    /// Forget `ip`; returns whether it was known
    pub async fn clear_route(&self, ip: IpAddr) -> bool {
        self.inner.registry.lock().await.clear(ip)
    }

    /// Snapshot of the IPs currently marked for routing
    pub async fn snapshot(&self) -> HashSet<IpAddr> {
        self.inner.registry.lock().await.snapshot()
    }

    /// Reconcile the device's installed subnets with the marked IPs
    ///
    /// # Errors
    ///
    /// Returns the first subnet operation the device rejected.
    pub async fn flush_routes(&self) -> Result<()> {
        let dns_ip = self.inner.config.dns.as_ref().map(|dns| dns.remote_ip);
        self.inner
            .registry
            .lock()
            .await
            .flush(self.inner.device.as_ref(), dns_ip)
            .await
            .map_err(Into::into)
    }
}

/// Block until the peer session is configured; false means shutdown came
/// first
async fn wait_ready(mut ready: watch::Receiver<bool>, cancel: &CancellationToken) -> bool {
    while !*ready.borrow_and_update() {
        tokio::select! {
            () = cancel.cancelled() => return false,
            changed = ready.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
    true
}

async fn device_loop(inner: Arc<RouterInner>) -> Result<()> {
    if !wait_ready(inner.ready.clone(), &inner.cancel).await {
        return Ok(());
    }
    debug!("device read loop starting");
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = tokio::select! {
            () = inner.cancel.cancelled() => return Ok(()),
            res = inner.device.read(&mut buf) => match res {
                Ok(n) => n,
                Err(e) => {
                    if inner.cancel.is_cancelled() {
                        return Ok(());
                    }
                    inner.cancel.cancel();
                    return Err(RouterError::DeviceRead(e).into());
                }
            },
        };
        if n == 0 {
            continue;
        }
        handle_packet(&inner, &buf[..n]).await;
    }
}

async fn write_loop(inner: Arc<RouterInner>) -> Result<()> {
    let Some(mut rx) = inner.to_device_rx.lock().take() else {
        return Ok(());
    };
    loop {
        let pkt = tokio::select! {
            () = inner.cancel.cancelled() => return Ok(()),
            pkt = rx.recv() => match pkt {
                Some(pkt) => pkt,
                None => return Ok(()),
            },
        };
        if let Err(e) = inner.device.write(&pkt).await {
            if inner.cancel.is_cancelled() {
                return Ok(());
            }
            inner.cancel.cancel();
            return Err(RouterError::DeviceWrite(e).into());
        }
    }
}

async fn stream_loop(inner: Arc<RouterInner>, factory: HandlerFactory) -> Result<()> {
    if !wait_ready(inner.ready.clone(), &inner.cancel).await {
        return Ok(());
    }
    let mux = StreamMux::new(Arc::clone(&inner.transport), inner.pool.clone(), factory);
    let result = mux.read_loop(inner.cancel.clone()).await;
    if let Err(e) = &result {
        error!("tunnel stream failed: {e}");
        inner.cancel.cancel();
    }
    result
}

/// Handler factory for frames arriving from the tunnel: the same virtual
/// handlers the packet paths create
fn virtual_factory(inner: Arc<RouterInner>) -> HandlerFactory {
    Arc::new(move |id, release| {
        let inner = Arc::clone(&inner);
        Box::pin(async move { build_virtual_handler(&inner, id, release).await })
    })
}

async fn build_virtual_handler(
    inner: &Arc<RouterInner>,
    id: ConnId,
    release: Release,
) -> Result<Handler> {
    match id.protocol() {
        PROTO_TCP => Ok(Handler::Tcp(TcpHandler::new(
            id,
            Arc::clone(&inner.transport),
            release,
            inner.to_device.clone(),
        ))),
        PROTO_UDP => {
            if let Some(dns) = inner.config.dns.as_ref() {
                let dst = id.destination();
                if dns.remote_ip == dst.ip() && dns.remote_port == dst.port() {
                    let interceptor = DnsInterceptor::new(
                        id,
                        release,
                        inner.to_device.clone(),
                        dns.local_addr,
                        inner.config.conn_ttl(),
                        inner.cancel.child_token(),
                    )
                    .await
                    .map_err(TunnelError::from)?;
                    return Ok(Handler::Dns(interceptor));
                }
            }
            Ok(Handler::Udp(UdpHandler::new(
                id,
                Arc::clone(&inner.transport),
                release,
                inner.to_device.clone(),
            )))
        }
        other => Err(RouterError::UnhandledProtocol(other).into()),
    }
}

async fn handle_packet(inner: &Arc<RouterInner>, data: &[u8]) {
    let header = match packet::parse_ip_header(data) {
        Ok(header) => header,
        Err(e) => {
            debug!("dropping unparseable packet: {e}");
            return;
        }
    };
    if header.total_len > inner.config.mtu {
        debug!(
            "packet of {} bytes exceeds MTU {}",
            header.total_len, inner.config.mtu
        );
        refuse(inner, data, UnreachableReason::FragmentationNeeded).await;
        return;
    }

    let owned;
    let (header, data) = if let Some(frag) = header.fragment {
        let now = Instant::now();
        let assembled = {
            let mut map = inner.fragments.lock();
            map.evict_stale(now);
            map.add(
                frag.ident,
                frag.byte_offset,
                frag.more_fragments,
                &data[..header.header_len],
                &data[header.header_len..header.total_len.min(data.len())],
                now,
            )
        };
        match assembled {
            None => return,
            Some(pkt) => {
                owned = pkt;
                match packet::parse_ip_header(&owned) {
                    Ok(header) => (header, owned.as_slice()),
                    Err(e) => {
                        debug!("dropping broken fragment chain: {e}");
                        return;
                    }
                }
            }
        }
    } else {
        (header, data)
    };

    match header.protocol {
        PROTO_TCP => route_tcp(inner, &header, data).await,
        PROTO_UDP => route_udp(inner, &header, data).await,
        PROTO_ICMP | PROTO_ICMPV6 => {
            debug!("dropping ICMP packet {} -> {}", header.src, header.dst);
        }
        other => {
            debug!(
                "refusing protocol {other} packet {} -> {}",
                header.src, header.dst
            );
            refuse(inner, data, UnreachableReason::ProtocolUnreachable).await;
        }
    }
}

async fn route_tcp(inner: &Arc<RouterInner>, header: &IpHeader, data: &[u8]) {
    let l4 = &data[header.header_len..header.total_len.min(data.len())];
    let Some((src_port, dst_port)) = packet::tcp_ports(l4) else {
        debug!("dropping TCP packet with a broken header");
        return;
    };
    let id = ConnId::new(PROTO_TCP, header.src, header.dst, src_port, dst_port);
    let payload = Bytes::copy_from_slice(packet::tcp_payload(l4));
    dispatch(inner, id, payload).await;
}

async fn route_udp(inner: &Arc<RouterInner>, header: &IpHeader, data: &[u8]) {
    if is_link_local(header.dst) {
        trace!("dropping link-local packet to {}", header.dst);
        return;
    }
    if let IpAddr::V4(v4) = header.dst {
        let octets = v4.octets();
        if octets[2] == 0 && octets[3] == 0 {
            refuse(inner, data, UnreachableReason::HostUnreachable).await;
            return;
        }
    }
    let l4 = &data[header.header_len..header.total_len.min(data.len())];
    let Some((src_port, dst_port)) = packet::udp_ports(l4) else {
        debug!("dropping UDP packet with a broken header");
        return;
    };
    if inner.blocked_udp_ports.contains(&src_port) || inner.blocked_udp_ports.contains(&dst_port)
    {
        debug!("refusing blocked UDP port {src_port} -> {dst_port}");
        refuse(inner, data, UnreachableReason::PortUnreachable).await;
        return;
    }
    let id = ConnId::new(PROTO_UDP, header.src, header.dst, src_port, dst_port);
    let payload = Bytes::copy_from_slice(packet::udp_payload(l4));
    dispatch(inner, id, payload).await;
}

async fn dispatch(inner: &Arc<RouterInner>, id: ConnId, payload: Bytes) {
    let factory_inner = Arc::clone(inner);
    let handler = match inner
        .pool
        .get(id, move |release| async move {
            build_virtual_handler(&factory_inner, id, release).await
        })
        .await
    {
        Ok(handler) => handler,
        Err(e) => {
            error!(%id, "failed to create handler: {e}");
            return;
        }
    };
    handler.handle_packet(payload).await;
}

/// Send an ICMP refusal for `original` when one can be built
async fn refuse(inner: &Arc<RouterInner>, original: &[u8], reason: UnreachableReason) {
    match icmp::destination_unreachable(original, reason) {
        Some(reply) => {
            if inner.to_device.send(reply).await.is_err() {
                debug!("device queue gone, dropping ICMP reply");
            }
        }
        None => debug!("refused packet gets no ICMP reply"),
    }
}

fn is_link_local(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            (first & 0xffc0) == 0xfe80 || first == 0xff02
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ChannelDevice;
    use crate::transport::ChannelTransport;

    fn router() -> (TunRouter, watch::Sender<bool>) {
        let (device, _inject, _drain) = ChannelDevice::new(16);
        let (local, _remote) = ChannelTransport::pair(16);
        let (ready_tx, ready_rx) = watch::channel(false);
        let router = TunRouter::new(
            device,
            Arc::new(local),
            TunnelConfig::default(),
            ready_rx,
        );
        (router, ready_tx)
    }

    #[test]
    fn test_link_local_detection() {
        assert!(is_link_local("169.254.1.1".parse().unwrap()));
        assert!(is_link_local("fe80::1".parse().unwrap()));
        assert!(is_link_local("ff02::fb".parse().unwrap()));
        assert!(!is_link_local("10.0.0.1".parse().unwrap()));
        assert!(!is_link_local("fd00::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (router, _ready_tx) = router();
        router.stop().await;
        router.stop().await;
        assert_eq!(router.inner.state.load(Ordering::Acquire), CLOSED);
    }

    #[tokio::test]
    async fn test_route_bookkeeping() {
        let (router, _ready_tx) = router();
        assert!(router.add_route("10.0.0.1".parse().unwrap()).await);
        assert!(!router.add_route("10.0.0.1".parse().unwrap()).await);
        router.flush_routes().await.unwrap();
        assert!(router.clear_route("10.0.0.1".parse().unwrap()).await);
        assert!(router.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_exits_when_cancelled_before_ready() {
        let (router, ready_tx) = router();
        let run = {
            let router = router.clone();
            tokio::spawn(async move { router.run().await })
        };
        tokio::task::yield_now().await;
        router.stop().await;
        run.await.unwrap().unwrap();
        drop(ready_tx);
    }
}
