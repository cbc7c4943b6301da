//! Route planning for the capture device
//!
//! The embedding daemon reports individual destination IPs worth routing
//! into the tunnel; the registry widens them into covering subnets (/16 for
//! IPv4, /64 for IPv6) and keeps the device's installed route set in sync.
//! Mutation is cheap and local; only an explicit flush touches the device.

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use tracing::debug;

use crate::device::TunDevice;
use crate::error::RouterError;

const V4_PREFIX: u8 = 16;
const V6_PREFIX: u8 = 64;

/// Widen `ip` to its covering subnet
#[must_use]
pub fn covering_subnet(ip: IpAddr) -> IpNet {
    match ip {
        IpAddr::V4(v4) => IpNet::V4(
            Ipv4Net::new(v4, V4_PREFIX).map_or_else(|_| Ipv4Net::default(), |n| n.trunc()),
        ),
        IpAddr::V6(v6) => IpNet::V6(
            Ipv6Net::new(v6, V6_PREFIX).map_or_else(|_| Ipv6Net::default(), |n| n.trunc()),
        ),
    }
}

/// Widen a set of IPs into their covering subnets, deduplicated, in first-
/// seen order
#[must_use]
pub fn covering_subnets<I>(ips: I) -> Vec<IpNet>
where
    I: IntoIterator<Item = IpAddr>,
{
    let mut nets = Vec::new();
    for ip in ips {
        let net = covering_subnet(ip);
        if !nets.contains(&net) {
            nets.push(net);
        }
    }
    nets
}

/// Check whether `outer` contains every address of `inner`
#[must_use]
pub fn covers(outer: &IpNet, inner: &IpNet) -> bool {
    outer.contains(inner)
}

/// Desired and installed route state for one capture device
#[derive(Default)]
pub struct SubnetRegistry {
    ips: HashSet<IpAddr>,
    installed: HashSet<IpNet>,
}

impl SubnetRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `ip` as worth routing; returns whether it was new
    pub fn add(&mut self, ip: IpAddr) -> bool {
        self.ips.insert(ip)
    }

    /// Forget `ip`; returns whether it was known
    pub fn clear(&mut self, ip: IpAddr) -> bool {
        self.ips.remove(&ip)
    }

    /// Snapshot of the currently known IPs
    #[must_use]
    pub fn snapshot(&self) -> HashSet<IpAddr> {
        self.ips.clone()
    }

    /// Subnets currently installed on the device
    #[must_use]
    pub fn installed(&self) -> Vec<IpNet> {
        self.installed.iter().copied().collect()
    }

    /// Reconcile the device's routes with the known IPs
    ///
    /// Subnets no longer backed by any IP, or superseded by a wider new
    /// subnet, are removed first; then missing subnets are installed. When
    /// a DNS address is given, its subnet installs before the others so
    /// name resolution recovers first. The first device failure aborts the
    /// flush; a later flush picks up where this one left off.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::SubnetOp` naming the subnet the device
    /// rejected.
    pub async fn flush(
        &mut self,
        device: &dyn TunDevice,
        dns_ip: Option<IpAddr>,
    ) -> Result<(), RouterError> {
        let desired = covering_subnets(self.ips.iter().copied());

        let mut to_remove: Vec<IpNet> = self
            .installed
            .iter()
            .filter(|net| !self.ips.iter().any(|ip| net.contains(ip)))
            .copied()
            .collect();
        let mut to_add = Vec::new();
        for net in desired {
            if self
                .installed
                .iter()
                .any(|installed| covers(installed, &net) && !to_remove.contains(installed))
            {
                continue;
            }
            for installed in &self.installed {
                if covers(&net, installed) && !to_remove.contains(installed) {
                    to_remove.push(*installed);
                }
            }
            to_add.push(net);
        }

        for net in to_remove {
            debug!("removing subnet {net}");
            device
                .remove_subnet(net)
                .await
                .map_err(|source| RouterError::SubnetOp { net, source })?;
            self.installed.remove(&net);
        }

        if let Some(dns) = dns_ip {
            if let Some(pos) = to_add.iter().position(|net| net.contains(&dns)) {
                to_add.swap(0, pos);
            }
        }
        for net in to_add {
            debug!("adding subnet {net}");
            device
                .add_subnet(net)
                .await
                .map_err(|source| RouterError::SubnetOp { net, source })?;
            self.installed.insert(net);
        }
        Ok(())
    }
}
