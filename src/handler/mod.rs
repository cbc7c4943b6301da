//! Connection handlers
//!
//! A handler owns the lifecycle of one logical connection inside a tunnel
//! session. The pool stores handlers behind the [`Handler`] enum so the
//! dispatch paths stay monomorphic; every variant is internally
//! reference-counted and cheap to clone.
//!
//! Handlers never propagate per-connection failures to their callers. A
//! broken socket or a rejected dial is resolved locally: log it, notify the
//! peer where the protocol calls for it, close, release.

pub mod dialer;
pub mod dns;
pub mod tcp;
pub mod udp;

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::connid::ConnId;
use crate::proto::{ControlCode, ControlMessage, Message};
use crate::transport::{send_message, Transport};

pub use dialer::{Dialer, DialerConfig};
pub use dns::DnsInterceptor;
pub use tcp::TcpHandler;
pub use udp::UdpHandler;

/// One pooled connection handler
#[derive(Clone)]
pub enum Handler {
    /// Peer-side dialer driving a real socket
    Dialer(Dialer),
    /// Router-side virtual TCP connection
    Tcp(TcpHandler),
    /// Router-side virtual UDP connection
    Udp(UdpHandler),
    /// Router-side DNS interception to a local resolver
    Dns(DnsInterceptor),
}

impl Handler {
    /// Connection this handler serves
    #[must_use]
    pub fn id(&self) -> ConnId {
        match self {
            Self::Dialer(h) => h.id(),
            Self::Tcp(h) => h.id(),
            Self::Udp(h) => h.id(),
            Self::Dns(h) => h.id(),
        }
    }

    /// Run the handler's initial actions; called exactly once by the pool
    /// before the handler becomes visible
    pub async fn start(&self) {
        match self {
            Self::Dialer(h) => h.start().await,
            Self::Tcp(h) => h.start().await,
            Self::Dns(h) => h.start(),
            Self::Udp(_) => {}
        }
    }

    /// Apply a lifecycle control frame from the peer
    pub async fn handle_control(&self, cm: ControlMessage) {
        match self {
            Self::Dialer(h) => h.handle_control(cm).await,
            Self::Tcp(h) => h.handle_control(cm).await,
            Self::Udp(h) => h.handle_control(&cm),
            Self::Dns(h) => h.handle_control(&cm),
        }
    }

    /// Apply a payload frame arriving from the tunnel
    pub async fn handle_message(&self, data: Bytes) {
        match self {
            Self::Dialer(h) => h.handle_message(data).await,
            Self::Tcp(h) => h.handle_message(data).await,
            Self::Udp(h) => h.handle_message(data).await,
            Self::Dns(h) => h.handle_message(&data),
        }
    }

    /// Apply an L4 payload extracted from a captured packet
    pub async fn handle_packet(&self, payload: Bytes) {
        match self {
            Self::Dialer(h) => h.handle_packet(&payload),
            Self::Tcp(h) => h.handle_packet(payload).await,
            Self::Udp(h) => h.handle_packet(payload).await,
            Self::Dns(h) => h.handle_packet(payload).await,
        }
    }

    /// Close the handler and release its pool entry; idempotent
    pub async fn close(&self) {
        match self {
            Self::Dialer(h) => h.close().await,
            Self::Tcp(h) => h.close().await,
            Self::Udp(h) => h.close(),
            Self::Dns(h) => h.close(),
        }
    }

    /// Instant of the last observed traffic in either direction
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        match self {
            Self::Dialer(h) => h.last_activity(),
            Self::Tcp(h) => h.last_activity(),
            Self::Udp(h) => h.last_activity(),
            Self::Dns(h) => h.last_activity(),
        }
    }
}

/// Last-traffic timestamp shared across a handler's tasks
pub(crate) struct Activity(parking_lot::Mutex<Instant>);

impl Activity {
    pub(crate) fn new() -> Self {
        Self(parking_lot::Mutex::new(Instant::now()))
    }

    pub(crate) fn touch(&self) {
        *self.0.lock() = Instant::now();
    }

    pub(crate) fn last(&self) -> Instant {
        *self.0.lock()
    }
}

/// Send one control frame, logging instead of propagating a send failure
pub(crate) async fn send_control(transport: &Arc<dyn Transport>, id: ConnId, code: ControlCode) {
    debug!(%id, %code, "sending control");
    if let Err(e) = send_message(transport.as_ref(), &Message::control(id, code)).await {
        warn!(%id, %code, "failed to send control: {e}");
    }
}
