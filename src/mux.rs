//! Stream multiplexing
//!
//! One tunnel stream carries frames for many logical connections. The
//! multiplexer owns the single read loop on that stream: decode each frame,
//! look up or create the handler for its connection id, and hand the frame
//! over. Malformed frames are logged and dropped; only transport failures
//! end the loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connid::{ConnId, PROTO_TCP, PROTO_UDP};
use crate::error::{Result, RouterError};
use crate::handler::{Dialer, DialerConfig, Handler};
use crate::pool::{Pool, Release};
use crate::proto::Message;
use crate::transport::Transport;

/// Future produced by a [`HandlerFactory`]
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Handler>> + Send>>;

/// Constructor for the handler of a first-seen connection id
pub type HandlerFactory = Arc<dyn Fn(ConnId, Release) -> HandlerFuture + Send + Sync>;

/// Demultiplexer for one shared tunnel stream
pub struct StreamMux {
    transport: Arc<dyn Transport>,
    pool: Pool,
    factory: HandlerFactory,
}

impl StreamMux {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, pool: Pool, factory: HandlerFactory) -> Self {
        Self {
            transport,
            pool,
            factory,
        }
    }

    /// Run the read loop until the stream ends or `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns the transport error that ended the stream; orderly end of
    /// stream and cancellation are not errors.
    pub async fn read_loop(&self, cancel: CancellationToken) -> Result<()> {
        debug!("stream read loop starting");
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                res = self.transport.recv() => match res {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        debug!("end of stream");
                        return Ok(());
                    }
                    Err(e) => {
                        if cancel.is_cancelled() {
                            return Ok(());
                        }
                        return Err(e.into());
                    }
                },
            };
            match Message::decode(&frame) {
                Ok(msg) => self.dispatch(msg).await,
                Err(e) => warn!("dropping malformed frame: {e}"),
            }
        }
    }

    /// Route one decoded frame to its connection handler
    async fn dispatch(&self, msg: Message) {
        let id = msg.id();
        let factory = Arc::clone(&self.factory);
        let handler = match self.pool.get(id, move |release| factory(id, release)).await {
            Ok(handler) => handler,
            Err(e) => {
                warn!(%id, "no handler for frame: {e}");
                return;
            }
        };
        match msg {
            Message::Control(cm) => handler.handle_control(cm).await,
            Message::Payload { data, .. } => handler.handle_message(data).await,
        }
    }
}

/// Factory for the peer side of the tunnel: every first-seen id gets a
/// dialer driving a real socket
#[must_use]
pub fn dialer_factory(
    transport: Arc<dyn Transport>,
    config: DialerConfig,
    cancel: CancellationToken,
) -> HandlerFactory {
    Arc::new(move |id, release| {
        let transport = Arc::clone(&transport);
        let cancel = cancel.child_token();
        Box::pin(async move {
            match id.protocol() {
                PROTO_TCP | PROTO_UDP => Ok(Handler::Dialer(Dialer::new(
                    id, transport, release, cancel, config,
                ))),
                other => Err(RouterError::UnhandledProtocol(other).into()),
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    use crate::proto::ControlCode;
    use crate::transport::{send_message, ChannelTransport};

    #[tokio::test]
    async fn test_connect_to_refused_port_answers_reject() {
        let (peer_end, local_end) = ChannelTransport::pair(16);
        let peer_end = Arc::new(peer_end);
        let pool = Pool::new();
        let cancel = CancellationToken::new();
        let mux = StreamMux::new(
            Arc::clone(&peer_end) as Arc<dyn Transport>,
            pool.clone(),
            dialer_factory(
                Arc::clone(&peer_end) as Arc<dyn Transport>,
                DialerConfig::default(),
                cancel.clone(),
            ),
        );
        let loop_task = tokio::spawn(async move { mux.read_loop(cancel).await });

        let id = ConnId::new(
            PROTO_TCP,
            "10.0.0.1".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
            41000,
            1,
        );
        send_message(&local_end, &Message::control(id, ControlCode::Connect))
            .await
            .unwrap();

        let frame = local_end.recv().await.unwrap().unwrap();
        assert_eq!(
            Message::decode(&frame).unwrap(),
            Message::control(id, ControlCode::ConnectReject)
        );
        assert!(pool.is_empty());

        drop(local_end);
        loop_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_end_loop() {
        let (peer_end, local_end) = ChannelTransport::pair(16);
        let peer_end = Arc::new(peer_end);
        let pool = Pool::new();
        let cancel = CancellationToken::new();
        let mux = StreamMux::new(
            Arc::clone(&peer_end) as Arc<dyn Transport>,
            pool.clone(),
            dialer_factory(
                Arc::clone(&peer_end) as Arc<dyn Transport>,
                DialerConfig::default(),
                cancel.clone(),
            ),
        );
        let loop_task = tokio::spawn(async move { mux.read_loop(cancel).await });

        local_end.send(Bytes::from_static(b"\xffgarbage")).await.unwrap();

        // The loop survives; a valid frame after the garbage still works.
        let udp = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dst = udp.local_addr().unwrap();
        let id = ConnId::new(PROTO_UDP, "10.0.0.1".parse().unwrap(), dst.ip(), 41001, dst.port());
        send_message(&local_end, &Message::payload(id, Bytes::from_static(b"ping")))
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = udp.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        drop(local_end);
        loop_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unhandled_protocol_is_dropped() {
        let (peer_end, local_end) = ChannelTransport::pair(16);
        let peer_end = Arc::new(peer_end);
        let pool = Pool::new();
        let cancel = CancellationToken::new();
        let mux = StreamMux::new(
            Arc::clone(&peer_end) as Arc<dyn Transport>,
            pool.clone(),
            dialer_factory(
                Arc::clone(&peer_end) as Arc<dyn Transport>,
                DialerConfig::default(),
                cancel.clone(),
            ),
        );
        let loop_task = tokio::spawn(async move { mux.read_loop(cancel).await });

        // SCTP is not carried; the frame is dropped without poisoning the
        // pool.
        let id = ConnId::new(
            132,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            41002,
            9,
        );
        send_message(&local_end, &Message::payload(id, Bytes::from_static(b"x")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pool.is_empty());

        drop(local_end);
        loop_task.await.unwrap().unwrap();
    }
}
