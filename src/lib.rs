//! tunlink: Connection-multiplexing tunnel engine
//!
//! This crate provides the data plane of a cluster-to-workstation traffic
//! tunnel: many logical TCP and UDP connections multiplexed over one shared
//! bidirectional stream, with a packet router on the workstation side and
//! socket dialers on the cluster side.
//!
//! # Features
//!
//! - **Frame Multiplexing**: Payload and lifecycle control frames keyed by
//!   a 5-tuple connection id on one shared stream
//! - **Connection Pooling**: Exactly-once handler creation, idle reaping,
//!   and graceful drain on shutdown
//! - **Packet Routing**: Classification of captured IP packets, IPv4
//!   fragment reassembly, and ICMP refusals for traffic that cannot go
//!   through
//! - **DNS Interception**: Queries to the remote resolver short-circuited
//!   to a local one
//! - **Subnet Planning**: Covering subnets derived from observed IPs and
//!   reconciled against the capture device
//!
//! # Architecture
//!
//! ```text
//! capture device → TunRouter → Pool of handlers → Transport stream
//!                                                       ↕
//!                              Pool of dialers ← StreamMux (peer side)
//!                                    ↓
//!                              real TCP/UDP sockets
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunlink::{ChannelDevice, ChannelTransport, TunRouter, TunnelConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (device, _inject, _drain) = ChannelDevice::new(100);
//! let (local_end, _peer_end) = ChannelTransport::pair(100);
//! let (ready_tx, ready_rx) = tokio::sync::watch::channel(false);
//!
//! let router = TunRouter::new(device, Arc::new(local_end), TunnelConfig::default(), ready_rx);
//! router.add_route("10.0.0.1".parse()?).await;
//! router.flush_routes().await?;
//!
//! // Unblock traffic once the peer session is negotiated.
//! ready_tx.send(true)?;
//! router.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and validation
//! - [`connid`]: Connection identity and its wire encoding
//! - [`device`]: Capture device contract
//! - [`error`]: Error types
//! - [`handler`]: Per-connection handlers (dialer, TCP, UDP, DNS)
//! - [`mux`]: Stream demultiplexing
//! - [`packet`]: IP packet parsing and construction
//! - [`pool`]: Connection handler pool
//! - [`proto`]: Tunnel frame protocol
//! - [`router`]: Packet router
//! - [`subnet`]: Route planning for the capture device
//! - [`transport`]: Transport stream abstraction

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod connid;
pub mod device;
pub mod error;
pub mod handler;
pub mod mux;
pub mod packet;
pub mod pool;
pub mod proto;
pub mod router;
pub mod subnet;
pub mod transport;

// Re-export commonly used types at the crate root
pub use config::{DnsConfig, TunnelConfig};
pub use connid::{ConnId, PROTO_TCP, PROTO_UDP};
pub use device::{ChannelDevice, TunDevice};
pub use error::{
    ConfigError, ProtocolError, Result, RouterError, TransportError, TunnelError,
};
pub use handler::{Dialer, DialerConfig, DnsInterceptor, Handler, TcpHandler, UdpHandler};
pub use mux::{dialer_factory, HandlerFactory, StreamMux};
pub use pool::{Clock, Pool, Release, SystemClock};
pub use proto::{ControlCode, ControlMessage, Message};
pub use router::TunRouter;
pub use subnet::SubnetRegistry;
pub use transport::{send_message, ChannelTransport, Transport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
