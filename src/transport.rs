//! Transport stream abstraction
//!
//! The transport carries opaque frames between the two tunnel ends. Frame
//! decoding happens in the stream multiplexer, not here.
//!
//! # Concurrency contract
//!
//! `send` may be called concurrently from many handlers; implementations
//! serialize sends internally. `recv` is called only from the stream
//! multiplexer's single read loop.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::error::TransportError;
use crate::proto::Message;

/// Bidirectional frame transport shared by all handlers of one tunnel
/// session
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame; safe for concurrent callers
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` once the stream is gone.
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Receive the next frame; `Ok(None)` signals orderly end of stream
    ///
    /// # Errors
    ///
    /// Any error other than an orderly close is fatal to the stream.
    async fn recv(&self) -> Result<Option<Bytes>, TransportError>;
}

/// Encode and send one message on a transport
///
/// # Errors
///
/// Propagates the transport send error.
pub async fn send_message(
    transport: &dyn Transport,
    message: &Message,
) -> Result<(), TransportError> {
    transport.send(message.encode()).await
}

/// In-process transport over a pair of bounded channels
///
/// Used by tests and by local wiring where both tunnel ends live in one
/// process. `ChannelTransport::pair` returns the two connected ends.
pub struct ChannelTransport {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
}

impl ChannelTransport {
    /// Create two connected transport ends with the given channel capacity
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Self {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            Self {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.lock().await.recv().await)
    }
}
