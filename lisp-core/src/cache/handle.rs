//! The seam through which an entry reaches back into the store that owns it
//! (to remove itself on expiry) without the store and its entries forming an
//! `Rc` reference cycle: the store owns entries strongly, entries hold this
//! handle weakly.

use crate::address::IpPrefix;

pub trait CacheHandle {
    fn remove(&self, prefix: &IpPrefix);
}
