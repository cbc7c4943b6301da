//! Router-side virtual TCP connection
//!
//! The router never terminates TCP itself; segment sequencing, windows and
//! retransmission are the business of the stack that hands packets to the
//! capture device. This handler negotiates the peer-side socket with the
//! connect handshake, relays captured segment payloads into the tunnel, and
//! rebuilds returning payloads into segments addressed in reverse.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::connid::ConnId;
use crate::handler::{send_control, Activity};
use crate::packet;
use crate::pool::Release;
use crate::proto::{ControlCode, ControlMessage, Message};
use crate::transport::{send_message, Transport};

const NOT_CONNECTED: u8 = 0;
const CONNECTED: u8 = 1;
const CLOSED: u8 = 2;

struct Inner {
    id: ConnId,
    transport: Arc<dyn Transport>,
    release: Release,
    to_device: mpsc::Sender<Bytes>,
    activity: Activity,
    state: AtomicU8,
}

/// Virtual TCP connection negotiating a peer-side socket
#[derive(Clone)]
pub struct TcpHandler {
    inner: Arc<Inner>,
}

impl TcpHandler {
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
                state: AtomicU8::new(NOT_CONNECTED),
            }),
        }
    }

    /// Connection this handler serves
    #[must_use]
    pub fn id(&self) -> ConnId {
        self.inner.id
    }

    /// Ask the remote end to open its socket
    pub async fn start(&self) {
        send_control(&self.inner.transport, self.inner.id, ControlCode::Connect).await;
    }

    pub async fn handle_control(&self, cm: ControlMessage) {
        trace!(id = %self.inner.id, code = %cm.code, "control");
        match cm.code {
            ControlCode::ConnectOk => {
                let _ = self.inner.state.compare_exchange(
                    NOT_CONNECTED,
                    CONNECTED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
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
            ControlCode::ReadClosed | ControlCode::WriteClosed => {
                debug!(id = %self.inner.id, code = %cm.code, "remote socket half closed");
                self.close().await;
            }
            ControlCode::Connect | ControlCode::DisconnectOk => {
                debug!(id = %self.inner.id, code = %cm.code, "dropping control");
            }
        }
    }

    /// Relay a captured segment payload to the tunnel
    pub async fn handle_packet(&self, payload: Bytes) {
        self.inner.activity.touch();
        if payload.is_empty() {
            // Bare ACKs carry nothing worth tunneling.
            return;
        }
        let msg = Message::payload(self.inner.id, payload);
        if let Err(e) = send_message(self.inner.transport.as_ref(), &msg).await {
            debug!(id = %self.inner.id, "failed to relay segment: {e}");
        }
    }

    /// Rebuild a returning payload into a segment and queue it for the
    /// capture device
    pub async fn handle_message(&self, data: Bytes) {
        self.inner.activity.touch();
        let reply = packet::build_tcp_packet(
            self.inner.id.destination(),
            self.inner.id.source(),
            &data,
        );
        if self.inner.to_device.send(reply).await.is_err() {
            debug!(id = %self.inner.id, "device queue gone, dropping reply");
        }
    }

    /// Tell the remote end to close its socket and unregister; idempotent
    pub async fn close(&self) {
        let prev = self.inner.state.swap(CLOSED, Ordering::AcqRel);
        if prev == CLOSED {
            return;
        }
        debug!(id = %self.inner.id, "closing");
        if prev == CONNECTED {
            send_control(&self.inner.transport, self.inner.id, ControlCode::Disconnect).await;
        }
        self.inner.release.release();
    }

    /// Instant of the last relayed payload in either direction
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.inner.activity.last()
    }
}
