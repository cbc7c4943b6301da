//! ICMP destination-unreachable replies
//!
//! The router answers packets it refuses to forward with an ICMP error so
//! local applications fail fast instead of timing out. Only IPv4 replies
//! are generated; refused IPv6 traffic is logged and dropped.

use bytes::Bytes;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    Icmpv4DstUnreachable, Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Packet, Ipv4Repr,
};

const HOP_LIMIT: u8 = 64;

// RFC 792: quote the offending header plus the first 8 payload bytes.
const CITE_LEN: usize = 8;

/// Why the router refused to forward a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreachableReason {
    /// The packet exceeds the device MTU
    FragmentationNeeded,
    /// The destination host can never be reached (zero host part)
    HostUnreachable,
    /// The destination port is administratively blocked
    PortUnreachable,
    /// The L4 protocol is not carried over the tunnel
    ProtocolUnreachable,
}

impl From<UnreachableReason> for Icmpv4DstUnreachable {
    fn from(reason: UnreachableReason) -> Self {
        match reason {
            UnreachableReason::FragmentationNeeded => Self::FragRequired,
            UnreachableReason::HostUnreachable => Self::HostUnreachable,
            UnreachableReason::PortUnreachable => Self::PortUnreachable,
            UnreachableReason::ProtocolUnreachable => Self::ProtoUnreachable,
        }
    }
}

/// Build the ICMP destination-unreachable reply for a refused IPv4 packet
///
/// Returns `None` when the offending packet is not parseable IPv4, in which
/// case there is nothing sensible to cite back.
#[must_use]
pub fn destination_unreachable(original: &[u8], reason: UnreachableReason) -> Option<Bytes> {
    let offender = Ipv4Packet::new_checked(original).ok()?;
    let offender_payload = offender.payload();
    let data = &offender_payload[..offender_payload.len().min(CITE_LEN)];
    // The cited header must describe exactly the quoted bytes or the reply
    // does not parse back as a consistent ICMP error.
    let cited = Ipv4Repr {
        src_addr: offender.src_addr(),
        dst_addr: offender.dst_addr(),
        next_header: offender.next_header(),
        payload_len: data.len(),
        hop_limit: offender.hop_limit(),
    };
    let icmp = Icmpv4Repr::DstUnreachable {
        reason: reason.into(),
        header: cited,
        data,
    };
    let ip = Ipv4Repr {
        src_addr: offender.dst_addr(),
        dst_addr: offender.src_addr(),
        next_header: IpProtocol::Icmp,
        payload_len: icmp.buffer_len(),
        hop_limit: HOP_LIMIT,
    };

    let caps = ChecksumCapabilities::default();
    let mut buf = vec![0u8; ip.buffer_len() + ip.payload_len];
    let mut ip_pkt = Ipv4Packet::new_unchecked(&mut buf[..]);
    ip.emit(&mut ip_pkt, &caps);
    let mut icmp_pkt = Icmpv4Packet::new_unchecked(ip_pkt.payload_mut());
    icmp.emit(&mut icmp_pkt, &caps);
    Some(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connid::PROTO_UDP;
    use crate::packet;
    use smoltcp::wire::Icmpv4Message;
    use std::net::SocketAddr;

    #[test]
    fn test_reply_addressing_and_type() {
        let src: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let dst: SocketAddr = "10.0.0.2:137".parse().unwrap();
        let offending = packet::build_udp_packet(src, dst, b"netbios probe");

        let reply =
            destination_unreachable(&offending, UnreachableReason::PortUnreachable).unwrap();
        let header = packet::parse_ip_header(&reply).unwrap();
        assert_eq!(header.src, dst.ip());
        assert_eq!(header.dst, src.ip());
        assert_eq!(header.protocol, 1);

        let ip = Ipv4Packet::new_checked(&reply[..]).unwrap();
        let icmp = Icmpv4Packet::new_checked(ip.payload()).unwrap();
        assert_eq!(icmp.msg_type(), Icmpv4Message::DstUnreachable);
        assert_eq!(
            Icmpv4DstUnreachable::from(icmp.msg_code()),
            Icmpv4DstUnreachable::PortUnreachable
        );
    }

    #[test]
    fn test_cited_header_matches_offender() {
        let src: SocketAddr = "10.1.2.3:5000".parse().unwrap();
        let dst: SocketAddr = "10.0.0.0:80".parse().unwrap();
        let offending = packet::build_udp_packet(src, dst, b"payload bytes here");

        let reply =
            destination_unreachable(&offending, UnreachableReason::HostUnreachable).unwrap();
        let ip = Ipv4Packet::new_checked(&reply[..]).unwrap();
        let icmp = Icmpv4Packet::new_checked(ip.payload()).unwrap();
        let caps = ChecksumCapabilities::default();
        match Icmpv4Repr::parse(&icmp, &caps).unwrap() {
            Icmpv4Repr::DstUnreachable { header, data, .. } => {
                assert_eq!(header.src_addr, "10.1.2.3".parse::<std::net::Ipv4Addr>().unwrap());
                assert_eq!(header.dst_addr, "10.0.0.0".parse::<std::net::Ipv4Addr>().unwrap());
                assert_eq!(u8::from(header.next_header), PROTO_UDP);
                assert_eq!(data.len(), CITE_LEN);
            }
            other => panic!("unexpected ICMP repr {other:?}"),
        }
    }

    #[test]
    fn test_non_ipv4_offender_yields_nothing() {
        assert!(destination_unreachable(&[0x60, 0, 0, 0], UnreachableReason::HostUnreachable)
            .is_none());
    }
}
