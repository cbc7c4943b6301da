//! Connection identity
//!
//! A [`ConnId`] is the canonical 5-tuple (L4 protocol, source address and
//! port, destination address and port) identifying one logical connection.
//! Two packets belong to the same logical connection iff their `ConnId`s are
//! equal; the id doubles as the pool map key and as a wire field with a
//! fixed-width encoding per address family.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// IANA protocol number for TCP
pub const PROTO_TCP: u8 = 6;
/// IANA protocol number for UDP
pub const PROTO_UDP: u8 = 17;

/// Address family tag used in the wire encoding
const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Immutable 5-tuple identity of one logical connection
///
/// Construct with [`ConnId::new`]; both addresses must belong to the same
/// family for the wire encoding to be well formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    protocol: u8,
    src: SocketAddr,
    dst: SocketAddr,
}

impl ConnId {
    /// Create a new connection id from a classified packet's 5-tuple
    #[must_use]
    pub fn new(protocol: u8, src: IpAddr, dst: IpAddr, src_port: u16, dst_port: u16) -> Self {
        Self {
            protocol,
            src: SocketAddr::new(src, src_port),
            dst: SocketAddr::new(dst, dst_port),
        }
    }

    /// L4 protocol number (6 = TCP, 17 = UDP)
    #[must_use]
    pub const fn protocol(&self) -> u8 {
        self.protocol
    }

    /// Source socket address
    #[must_use]
    pub const fn source(&self) -> SocketAddr {
        self.src
    }

    /// Destination socket address
    #[must_use]
    pub const fn destination(&self) -> SocketAddr {
        self.dst
    }

    /// Check if this id identifies a TCP connection
    #[must_use]
    pub const fn is_tcp(&self) -> bool {
        self.protocol == PROTO_TCP
    }

    /// Check if this id identifies a UDP connection
    #[must_use]
    pub const fn is_udp(&self) -> bool {
        self.protocol == PROTO_UDP
    }

    /// The reply-direction id, with source and destination swapped
    #[must_use]
    pub const fn reply(&self) -> Self {
        Self {
            protocol: self.protocol,
            src: self.dst,
            dst: self.src,
        }
    }

    /// Length of the wire encoding for this id's address family
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        match self.src {
            SocketAddr::V4(_) => 2 + 4 + 4 + 2 + 2,
            SocketAddr::V6(_) => 2 + 16 + 16 + 2 + 2,
        }
    }

    /// Append the fixed-width wire encoding to `buf`
    ///
    /// Layout: protocol byte, family tag (4 or 6), source IP, destination
    /// IP, source port (BE), destination port (BE).
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.protocol);
        match (self.src.ip(), self.dst.ip()) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                buf.put_u8(FAMILY_V4);
                buf.put_slice(&s.octets());
                buf.put_slice(&d.octets());
            }
            (s, d) => {
                buf.put_u8(FAMILY_V6);
                buf.put_slice(&to_v6(s).octets());
                buf.put_slice(&to_v6(d).octets());
            }
        }
        buf.put_u16(self.src.port());
        buf.put_u16(self.dst.port());
    }

    /// Encode to a standalone buffer
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode an id from the front of `buf`, returning it together with the
    /// number of bytes consumed
    ///
    /// # Errors
    ///
    /// Returns a `ProtocolError` when the buffer is too short or carries an
    /// unknown family tag.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        if buf.len() < 2 {
            return Err(ProtocolError::ShortFrame { len: buf.len() });
        }
        let protocol = buf[0];
        let (addr_len, consumed) = match buf[1] {
            FAMILY_V4 => (4, 2 + 4 + 4 + 2 + 2),
            FAMILY_V6 => (16, 2 + 16 + 16 + 2 + 2),
            other => return Err(ProtocolError::UnknownAddressFamily(other)),
        };
        if buf.len() < consumed {
            return Err(ProtocolError::Truncated {
                expected: consumed,
                actual: buf.len(),
            });
        }
        let src = read_ip(&buf[2..2 + addr_len]);
        let dst = read_ip(&buf[2 + addr_len..2 + 2 * addr_len]);
        let ports = &buf[2 + 2 * addr_len..consumed];
        let src_port = u16::from_be_bytes([ports[0], ports[1]]);
        let dst_port = u16::from_be_bytes([ports[2], ports[3]]);
        Ok((Self::new(protocol, src, dst, src_port, dst_port), consumed))
    }

    fn protocol_str(&self) -> &'static str {
        match self.protocol {
            PROTO_TCP => "tcp",
            PROTO_UDP => "udp",
            _ => "ip",
        }
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol_str(), self.src, self.dst)
    }
}

fn to_v6(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

fn read_ip(bytes: &[u8]) -> IpAddr {
    if bytes.len() == 4 {
        IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
    } else {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(bytes);
        IpAddr::V6(Ipv6Addr::from(octets))
    }
}
