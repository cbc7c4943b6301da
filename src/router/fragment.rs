//! IPv4 fragment reassembly
//!
//! Captured fragments are collected per identification value until the
//! chain is contiguous from offset zero through the final fragment, then
//! rebuilt into a single packet. Chains that never complete are evicted
//! after a TTL so a lost fragment cannot pin memory.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use smoltcp::wire::Ipv4Packet;
use tracing::trace;

struct Block {
    offset: usize,
    data: Vec<u8>,
}

struct Chain {
    // Header of the offset-zero fragment; reused for the rebuilt packet.
    header: Option<Vec<u8>>,
    blocks: Vec<Block>,
    // Payload length of the full datagram, known once the final fragment
    // arrives.
    total: Option<usize>,
    last_seen: Instant,
}

impl Chain {
    fn new(now: Instant) -> Self {
        Self {
            header: None,
            blocks: Vec::new(),
            total: None,
            last_seen: now,
        }
    }

    fn is_complete(&self) -> bool {
        let Some(total) = self.total else {
            return false;
        };
        if self.header.is_none() {
            return false;
        }
        let mut next = 0;
        for block in &self.blocks {
            if block.offset > next {
                return false;
            }
            next = next.max(block.offset + block.data.len());
        }
        next >= total
    }

    fn assemble(&self) -> Vec<u8> {
        let header = self.header.as_deref().unwrap_or(&[]);
        let total = self.total.unwrap_or(0);
        let mut out = vec![0u8; header.len() + total];
        out[..header.len()].copy_from_slice(header);
        for block in &self.blocks {
            let start = header.len() + block.offset;
            let end = (start + block.data.len()).min(out.len());
            out[start..end].copy_from_slice(&block.data[..end - start]);
        }
        let total_len = out.len();
        let mut p = Ipv4Packet::new_unchecked(&mut out[..]);
        p.set_total_len(total_len as u16);
        p.set_more_frags(false);
        p.set_frag_offset(0);
        p.fill_checksum();
        out
    }
}

/// Reassembly state for all in-flight fragment chains
pub struct FragmentMap {
    chains: HashMap<u16, Chain>,
    ttl: Duration,
}

impl FragmentMap {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            chains: HashMap::new(),
            ttl,
        }
    }

    /// Add one fragment; returns the reassembled packet once the chain is
    /// complete
    ///
    /// `header` must be the IPv4 header bytes of this fragment and
    /// `payload` its L4 payload section. Arrival order does not matter.
    pub fn add(
        &mut self,
        ident: u16,
        byte_offset: usize,
        more_fragments: bool,
        header: &[u8],
        payload: &[u8],
        now: Instant,
    ) -> Option<Vec<u8>> {
        let chain = self.chains.entry(ident).or_insert_with(|| Chain::new(now));
        chain.last_seen = now;
        if byte_offset == 0 {
            chain.header = Some(header.to_vec());
        }
        if !more_fragments {
            let total = byte_offset + payload.len();
            chain.total = Some(total);
            // Blocks starting at or past the end fixed by the final
            // fragment cannot belong to this datagram.
            chain.blocks.retain(|block| block.offset < total);
        }
        let in_range = chain.total.map_or(true, |total| byte_offset < total);
        if in_range
            && chain
                .blocks
                .iter()
                .all(|block| block.offset != byte_offset)
        {
            chain.blocks.push(Block {
                offset: byte_offset,
                data: payload.to_vec(),
            });
            chain.blocks.sort_by_key(|block| block.offset);
        }
        if chain.is_complete() {
            trace!(ident, "fragment chain complete");
            let packet = chain.assemble();
            self.chains.remove(&ident);
            Some(packet)
        } else {
            None
        }
    }

    /// Drop chains that have not seen a fragment within the TTL
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let before = self.chains.len();
        let ttl = self.ttl;
        self.chains
            .retain(|_, chain| now.saturating_duration_since(chain.last_seen) < ttl);
        before - self.chains.len()
    }

    /// Number of in-flight chains
    #[must_use]
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    /// Check whether any chain is in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}
