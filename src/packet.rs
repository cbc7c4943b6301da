//! IP packet parsing and construction
//!
//! The router only needs a thin slice of packet smarts: pull the addressing
//! 5-tuple and fragment metadata out of captured packets, and build the UDP
//! and TCP reply packets that carry tunneled payloads back through the
//! capture device. Everything here leans on `smoltcp`'s wire types; no
//! header arithmetic is done by hand.

use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Packet, Ipv4Repr, Ipv6Packet, Ipv6Repr, TcpControl, TcpPacket,
    TcpRepr, TcpSeqNumber, UdpPacket, UdpRepr,
};

use crate::error::RouterError;

/// Hop limit for packets this crate originates
const HOP_LIMIT: u8 = 64;

/// Fragment metadata from an IPv4 header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    /// Identification field shared by all fragments of one datagram
    pub ident: u16,
    /// More-fragments flag
    pub more_fragments: bool,
    /// Payload offset in bytes
    pub byte_offset: usize,
}

/// The parts of an IP header the router routes on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpHeader {
    /// Source address
    pub src: IpAddr,
    /// Destination address
    pub dst: IpAddr,
    /// L4 protocol number
    pub protocol: u8,
    /// Header length in bytes; the L4 payload starts here
    pub header_len: usize,
    /// Total packet length in bytes
    pub total_len: usize,
    /// Present when the packet is an IPv4 fragment
    pub fragment: Option<FragmentInfo>,
}

/// Parse the IP header of a captured packet
///
/// Fragmented IPv4 packets parse fine; their L4 section is only meaningful
/// once reassembled. IPv6 extension headers are not walked, so `protocol`
/// for IPv6 is the next-header value of the fixed header.
///
/// # Errors
///
/// Returns `RouterError::MalformedPacket` for truncated packets and unknown
/// IP versions.
pub fn parse_ip_header(data: &[u8]) -> Result<IpHeader, RouterError> {
    match data.first().map(|b| b >> 4) {
        Some(4) => {
            let p = Ipv4Packet::new_checked(data)
                .map_err(|e| RouterError::MalformedPacket(format!("ipv4: {e}")))?;
            let fragment = if p.more_frags() || p.frag_offset() != 0 {
                Some(FragmentInfo {
                    ident: p.ident(),
                    more_fragments: p.more_frags(),
                    byte_offset: usize::from(p.frag_offset()),
                })
            } else {
                None
            };
            Ok(IpHeader {
                src: IpAddr::V4(p.src_addr()),
                dst: IpAddr::V4(p.dst_addr()),
                protocol: p.next_header().into(),
                header_len: usize::from(p.header_len()),
                total_len: usize::from(p.total_len()),
                fragment,
            })
        }
        Some(6) => {
            let p = Ipv6Packet::new_checked(data)
                .map_err(|e| RouterError::MalformedPacket(format!("ipv6: {e}")))?;
            Ok(IpHeader {
                src: IpAddr::V6(p.src_addr()),
                dst: IpAddr::V6(p.dst_addr()),
                protocol: p.next_header().into(),
                header_len: p.header_len(),
                total_len: p.total_len(),
                fragment: None,
            })
        }
        _ => Err(RouterError::MalformedPacket(
            "truncated or unknown IP version".into(),
        )),
    }
}

/// Source and destination ports of a UDP section
#[must_use]
pub fn udp_ports(l4: &[u8]) -> Option<(u16, u16)> {
    let p = UdpPacket::new_checked(l4).ok()?;
    Some((p.src_port(), p.dst_port()))
}

/// Source and destination ports of a TCP section
#[must_use]
pub fn tcp_ports(l4: &[u8]) -> Option<(u16, u16)> {
    let p = TcpPacket::new_checked(l4).ok()?;
    Some((p.src_port(), p.dst_port()))
}

/// Payload of a UDP section, honoring the length field
#[must_use]
pub fn udp_payload(l4: &[u8]) -> &[u8] {
    UdpPacket::new_checked(l4).map_or(&[], |p| p.payload())
}

/// Payload of a TCP section, honoring the data offset
#[must_use]
pub fn tcp_payload(l4: &[u8]) -> &[u8] {
    TcpPacket::new_checked(l4).map_or(&[], |p| p.payload())
}

fn ip_address(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(a) => IpAddress::Ipv4(a),
        IpAddr::V6(a) => IpAddress::Ipv6(a),
    }
}

/// Build a UDP packet from `src` to `dst` carrying `payload`
#[must_use]
pub fn build_udp_packet(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Bytes {
    let udp = UdpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
    };
    let caps = ChecksumCapabilities::default();
    let buf = match (src.ip(), dst.ip()) {
        (IpAddr::V4(src_addr), IpAddr::V4(dst_addr)) => {
            let ip = Ipv4Repr {
                src_addr,
                dst_addr,
                next_header: IpProtocol::Udp,
                payload_len: udp.header_len() + payload.len(),
                hop_limit: HOP_LIMIT,
            };
            let mut buf = vec![0u8; ip.buffer_len() + ip.payload_len];
            let mut ip_pkt = Ipv4Packet::new_unchecked(&mut buf[..]);
            ip.emit(&mut ip_pkt, &caps);
            let mut udp_pkt = UdpPacket::new_unchecked(ip_pkt.payload_mut());
            udp.emit(
                &mut udp_pkt,
                &ip_address(src.ip()),
                &ip_address(dst.ip()),
                payload.len(),
                |b| b.copy_from_slice(payload),
                &caps,
            );
            buf
        }
        (src_ip, dst_ip) => {
            let src_addr = to_v6(src_ip);
            let dst_addr = to_v6(dst_ip);
            let ip = Ipv6Repr {
                src_addr,
                dst_addr,
                next_header: IpProtocol::Udp,
                payload_len: udp.header_len() + payload.len(),
                hop_limit: HOP_LIMIT,
            };
            let mut buf = vec![0u8; ip.buffer_len() + ip.payload_len];
            let mut ip_pkt = Ipv6Packet::new_unchecked(&mut buf[..]);
            ip.emit(&mut ip_pkt);
            let mut udp_pkt = UdpPacket::new_unchecked(ip_pkt.payload_mut());
            udp.emit(
                &mut udp_pkt,
                &IpAddress::Ipv6(src_addr),
                &IpAddress::Ipv6(dst_addr),
                payload.len(),
                |b| b.copy_from_slice(payload),
                &caps,
            );
            buf
        }
    };
    Bytes::from(buf)
}

/// Build a bare TCP data segment from `src` to `dst` carrying `payload`
///
/// Sequencing, acknowledgements and window management belong to the stack
/// consuming the capture device; this segment only transports bytes.
#[must_use]
pub fn build_tcp_packet(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Bytes {
    let tcp = TcpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
        control: TcpControl::Psh,
        seq_number: TcpSeqNumber(0),
        ack_number: None,
        window_len: 0xffff,
        window_scale: None,
        max_seg_size: None,
        sack_permitted: false,
        sack_ranges: [None, None, None],
        timestamp: None,
        payload,
    };
    let caps = ChecksumCapabilities::default();
    let buf = match (src.ip(), dst.ip()) {
        (IpAddr::V4(src_addr), IpAddr::V4(dst_addr)) => {
            let ip = Ipv4Repr {
                src_addr,
                dst_addr,
                next_header: IpProtocol::Tcp,
                payload_len: tcp.buffer_len(),
                hop_limit: HOP_LIMIT,
            };
            let mut buf = vec![0u8; ip.buffer_len() + ip.payload_len];
            let mut ip_pkt = Ipv4Packet::new_unchecked(&mut buf[..]);
            ip.emit(&mut ip_pkt, &caps);
            let mut tcp_pkt = TcpPacket::new_unchecked(ip_pkt.payload_mut());
            tcp.emit(
                &mut tcp_pkt,
                &ip_address(src.ip()),
                &ip_address(dst.ip()),
                &caps,
            );
            buf
        }
        (src_ip, dst_ip) => {
            let src_addr = to_v6(src_ip);
            let dst_addr = to_v6(dst_ip);
            let ip = Ipv6Repr {
                src_addr,
                dst_addr,
                next_header: IpProtocol::Tcp,
                payload_len: tcp.buffer_len(),
                hop_limit: HOP_LIMIT,
            };
            let mut buf = vec![0u8; ip.buffer_len() + ip.payload_len];
            let mut ip_pkt = Ipv6Packet::new_unchecked(&mut buf[..]);
            ip.emit(&mut ip_pkt);
            let mut tcp_pkt = TcpPacket::new_unchecked(ip_pkt.payload_mut());
            tcp.emit(
                &mut tcp_pkt,
                &IpAddress::Ipv6(src_addr),
                &IpAddress::Ipv6(dst_addr),
                &caps,
            );
            buf
        }
    };
    Bytes::from(buf)
}

fn to_v6(addr: IpAddr) -> std::net::Ipv6Addr {
    match addr {
        IpAddr::V4(a) => a.to_ipv6_mapped(),
        IpAddr::V6(a) => a,
    }
}
