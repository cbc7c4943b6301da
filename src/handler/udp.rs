//! Router-side virtual UDP connection
//!
//! No socket exists on this side; the handler is pure relay glue. Captured
//! datagram payloads go to the tunnel as payload frames, and payload frames
//! coming back are rebuilt into UDP packets addressed in reverse and queued
//! for the capture device. UDP needs no connect handshake, so there is
//! nothing to negotiate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::connid::ConnId;
use crate::handler::Activity;
use crate::packet;
use crate::pool::Release;
use crate::proto::{ControlMessage, Message};
use crate::transport::{send_message, Transport};

struct Inner {
    id: ConnId,
    transport: Arc<dyn Transport>,
    release: Release,
    to_device: mpsc::Sender<Bytes>,
    activity: Activity,
    closed: AtomicBool,
}

/// Fire-and-forget relay for one UDP 5-tuple
#[derive(Clone)]
pub struct UdpHandler {
    inner: Arc<Inner>,
}

impl UdpHandler {
    #[must_use]
    pub fn new(
        id: ConnId,
        transport: Arc<dyn Transport>,
        release: Release,
        to_device: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                transport,
                release,
                to_device,
                activity: Activity::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Connection this handler serves
    #[must_use]
    pub fn id(&self) -> ConnId {
        self.inner.id
    }

    /// Relay a captured datagram payload to the tunnel
    pub async fn handle_packet(&self, payload: Bytes) {
        self.inner.activity.touch();
        let msg = Message::payload(self.inner.id, payload);
        if let Err(e) = send_message(self.inner.transport.as_ref(), &msg).await {
            debug!(id = %self.inner.id, "failed to relay datagram: {e}");
        }
    }

    /// Rebuild a returning payload into a UDP packet and queue it for the
    /// capture device
    pub async fn handle_message(&self, data: Bytes) {
        self.inner.activity.touch();
        let reply = packet::build_udp_packet(
            self.inner.id.destination(),
            self.inner.id.source(),
            &data,
        );
        if self.inner.to_device.send(reply).await.is_err() {
            debug!(id = %self.inner.id, "device queue gone, dropping reply");
        }
    }

    /// UDP has no lifecycle on the wire; control frames are dropped
    pub fn handle_control(&self, cm: &ControlMessage) {
        trace!(id = %self.inner.id, code = %cm.code, "dropping control on UDP connection");
    }

    /// Unregister from the pool; idempotent
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!(id = %self.inner.id, "closing");
            self.inner.release.release();
        }
    }

    /// Instant of the last relayed payload in either direction
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.inner.activity.last()
    }
}
