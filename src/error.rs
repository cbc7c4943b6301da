//! Error types for tunlink
//!
//! This module defines the error hierarchy for the tunnel engine. Errors are
//! categorized by subsystem; per-connection failures are handled locally by
//! the owning handler and never surface through these types.

use std::io;

use ipnet::IpNet;
use thiserror::Error;

/// Top-level error type for tunlink
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Wire protocol decode errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport stream errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Packet router and capture device errors
    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Check if this error is recoverable (the surrounding loop may continue)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Protocol(_) => true,
            Self::Transport(e) => e.is_recoverable(),
            Self::Router(e) => e.is_recoverable(),
            Self::Config(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Wire protocol decode errors
///
/// A malformed frame is logged and dropped by the stream multiplexer; the
/// connection it referenced keeps its prior state.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame too short to carry the mandatory fields
    #[error("Frame too short: {len} bytes")]
    ShortFrame { len: usize },

    /// Unknown frame marker byte
    #[error("Unknown frame marker: {0:#04x}")]
    UnknownMarker(u8),

    /// Control frame with an unrecognized code
    #[error("Unknown control code: {0:#04x}")]
    UnknownControlCode(u8),

    /// Connection id with an unrecognized address family tag
    #[error("Unknown address family tag: {0:#04x}")]
    UnknownAddressFamily(u8),

    /// Frame shorter than its encoding requires
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// Transport stream errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The stream was closed by the peer or the local end
    #[error("Transport stream closed")]
    Closed,

    /// I/O error on the underlying stream
    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Closed => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }
}

/// Packet router and capture device errors
#[derive(Debug, Error)]
pub enum RouterError {
    /// Unrecoverable capture device read error
    #[error("Device read error: {0}")]
    DeviceRead(#[source] io::Error),

    /// Unrecoverable capture device write error
    #[error("Device write error: {0}")]
    DeviceWrite(#[source] io::Error),

    /// The device write queue was closed while the router was running
    #[error("Device write queue closed")]
    QueueClosed,

    /// A subnet install/remove call failed; the flush that issued it aborts
    #[error("Subnet operation failed for {net}: {source}")]
    SubnetOp { net: IpNet, source: io::Error },

    /// Packet that could not be parsed far enough to classify
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// L4 protocol with no handler variant on the receiving side
    #[error("Unhandled L4 protocol: {0}")]
    UnhandledProtocol(u8),

    /// Router is shutting down
    #[error("Router is shutting down")]
    ShuttingDown,
}

impl RouterError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::DeviceRead(_) | Self::DeviceWrite(_) | Self::QueueClosed => false,
            Self::SubnetOp { .. } => false,
            Self::MalformedPacket(_) | Self::UnhandledProtocol(_) => true,
            Self::ShuttingDown => false,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Validation error (invalid values, inconsistent fields)
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Type alias for Result with `TunnelError`
pub type Result<T> = std::result::Result<T, TunnelError>;
