//! DNS interception
//!
//! Queries addressed to the remote resolver never cross the tunnel; they
//! are short-circuited to a resolver running locally. The handler owns one
//! connected UDP socket to that resolver and a reply pump that rebuilds
//! answers into packets that look like they came from the intercepted
//! resolver address.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::connid::ConnId;
use crate::handler::Activity;
use crate::packet;
use crate::pool::Release;
use crate::proto::ControlMessage;

const REPLY_BUF_SIZE: usize = 0x1000;

struct Inner {
    id: ConnId,
    release: Release,
    to_device: mpsc::Sender<Bytes>,
    socket: Arc<UdpSocket>,
    activity: Activity,
    closed: AtomicBool,
    cancel: CancellationToken,
    ttl: Duration,
}

/// Handler that answers intercepted DNS queries from a local resolver
#[derive(Clone)]
pub struct DnsInterceptor {
    inner: Arc<Inner>,
}

impl DnsInterceptor {
    /// Bind and connect the socket to the local resolver
    ///
    /// # Errors
    ///
    /// Propagates bind/connect failures; the pool then drops the entry so
    /// a later query may retry.
    pub async fn new(
        id: ConnId,
        release: Release,
        to_device: mpsc::Sender<Bytes>,
        local_resolver: SocketAddr,
        ttl: Duration,
        cancel: CancellationToken,
    ) -> io::Result<Self> {
        let bind = if local_resolver.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(local_resolver).await?;
        Ok(Self {
            inner: Arc::new(Inner {
                id,
                release,
                to_device,
                socket: Arc::new(socket),
                activity: Activity::new(),
                closed: AtomicBool::new(false),
                cancel,
                ttl,
            }),
        })
    }

    /// Connection this handler serves
    #[must_use]
    pub fn id(&self) -> ConnId {
        self.inner.id
    }

    /// Spawn the reply pump
    pub fn start(&self) {
        let this = self.clone();
        tokio::spawn(async move { this.reply_pump().await });
    }

    /// Relay an intercepted query payload to the local resolver
    pub async fn handle_packet(&self, query: Bytes) {
        self.inner.activity.touch();
        if let Err(e) = self.inner.socket.send(&query).await {
            debug!(id = %self.inner.id, "failed to forward query: {e}");
        }
    }

    /// Intercepted connections never receive tunnel frames
    pub fn handle_message(&self, _data: &Bytes) {
        debug!(id = %self.inner.id, "unexpected tunnel frame on intercepted connection");
    }

    /// Intercepted connections never receive control frames
    pub fn handle_control(&self, cm: &ControlMessage) {
        trace!(id = %self.inner.id, code = %cm.code, "dropping control on intercepted connection");
    }

    /// Unregister from the pool and stop the reply pump; idempotent
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!(id = %self.inner.id, "closing");
            self.inner.cancel.cancel();
            self.inner.release.release();
        }
    }

    /// Instant of the last query or answer
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.inner.activity.last()
    }

    async fn reply_pump(self) {
        let mut buf = vec![0u8; REPLY_BUF_SIZE];
        loop {
            let read = tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                res = timeout(self.inner.ttl, self.inner.socket.recv(&mut buf)) => res,
            };
            match read {
                Err(_) => {
                    debug!(id = %self.inner.id, "idle too long, closing");
                    break;
                }
                Ok(Err(e)) => {
                    debug!(id = %self.inner.id, "resolver socket recv failed: {e}");
                    break;
                }
                Ok(Ok(n)) => {
                    self.inner.activity.touch();
                    let reply = packet::build_udp_packet(
                        self.inner.id.destination(),
                        self.inner.id.source(),
                        &buf[..n],
                    );
                    if self.inner.to_device.send(reply).await.is_err() {
                        break;
                    }
                }
            }
        }
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connid::PROTO_UDP;
    use crate::handler::Handler;
    use crate::pool::Pool;

    #[tokio::test]
    async fn test_query_answered_from_local_resolver() {
        let resolver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let resolver_addr = resolver.local_addr().unwrap();
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, from) = resolver.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"\x12\x34query");
            resolver.send_to(b"\x12\x34answer", from).await.unwrap();
        });

        let id = ConnId::new(
            PROTO_UDP,
            "10.0.0.1".parse().unwrap(),
            "10.96.0.10".parse().unwrap(),
            5300,
            53,
        );
        let (to_device, mut device_rx) = mpsc::channel(4);
        let pool = Pool::new();
        let handler = pool
            .get(id, |release| async move {
                let interceptor = DnsInterceptor::new(
                    id,
                    release,
                    to_device,
                    resolver_addr,
                    Duration::from_secs(300),
                    CancellationToken::new(),
                )
                .await
                .map_err(crate::error::TunnelError::from)?;
                Ok(Handler::Dns(interceptor))
            })
            .await
            .unwrap();

        handler.handle_packet(Bytes::from_static(b"\x12\x34query")).await;
        responder.await.unwrap();

        let reply = device_rx.recv().await.unwrap();
        let header = packet::parse_ip_header(&reply).unwrap();
        assert_eq!(header.src, id.destination().ip());
        assert_eq!(header.dst, id.source().ip());
        let l4 = &reply[header.header_len..];
        let (src_port, dst_port) = packet::udp_ports(l4).unwrap();
        assert_eq!(src_port, 53);
        assert_eq!(dst_port, 5300);
        assert_eq!(packet::udp_payload(l4), b"\x12\x34answer");

        handler.close().await;
        assert!(pool.is_empty());
    }
}
