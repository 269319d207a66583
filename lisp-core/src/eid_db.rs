//! Local EID membership (component E): answers "is this source address one
//! of ours" for the egress engine's native-vs-encapsulate decision.

use crate::address::{IpAddress, IpPrefix};
use ipnet::{Ipv4Net, Ipv6Net};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// Read-side seam the egress engine depends on. Kept separate from any
/// particular backing store so tests can supply a fixed set without wiring
/// up the `ArcSwap` snapshot machinery.
pub trait LocalEidDb {
    fn is_local_eid(&self, address: &IpAddress) -> bool;
}

/// Snapshot of locally-configured EID prefixes, atomically swappable so a
/// config reload never blocks or races an in-flight lookup.
#[derive(Debug, Clone, Default)]
pub struct EidSnapshot {
    v4: Vec<Ipv4Net>,
    v6: Vec<Ipv6Net>,
}

impl EidSnapshot {
    pub fn new(v4: Vec<Ipv4Net>, v6: Vec<Ipv6Net>) -> Self {
        Self { v4, v6 }
    }

    pub fn from_prefixes(prefixes: &[IpPrefix]) -> Self {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for p in prefixes {
            match p.address {
                IpAddress::V4(a) => {
                    if let Ok(net) = Ipv4Net::new(Ipv4Addr::from(a), p.length) {
                        v4.push(net);
                    }
                }
                IpAddress::V6(a) => {
                    if let Ok(net) = Ipv6Net::new(Ipv6Addr::from(a), p.length) {
                        v6.push(net);
                    }
                }
            }
        }
        Self { v4, v6 }
    }

    fn contains(&self, address: &IpAddress) -> bool {
        match *address {
            IpAddress::V4(a) => {
                let ip = Ipv4Addr::from(a);
                self.v4.iter().any(|net| net.contains(&ip))
            }
            IpAddress::V6(a) => {
                let ip = Ipv6Addr::from(a);
                self.v6.iter().any(|net| net.contains(&ip))
            }
        }
    }
}

/// `ArcSwap`-backed [`LocalEidDb`]: lookups read the current `Arc` with no
/// locking; [`Self::reload`] installs a new snapshot atomically.
pub struct SwappableEidDb {
    snapshot: arc_swap::ArcSwap<EidSnapshot>,
}

impl SwappableEidDb {
    pub fn new(initial: EidSnapshot) -> Self {
        Self { snapshot: arc_swap::ArcSwap::from_pointee(initial) }
    }

    pub fn reload(&self, snapshot: EidSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }
}

impl LocalEidDb for SwappableEidDb {
    fn is_local_eid(&self, address: &IpAddress) -> bool {
        self.snapshot.load().contains(address)
    }
}
