//! Upward interface to the (out-of-scope) Map-Request/Map-Reply collaborator.
//!
//! The wire codec and UDP control socket are external collaborators per the
//! core's scope; this crate only defines the callback boundary the egress
//! engine and entry lifecycle drive.

use crate::address::{IpAddress, IpPrefix};

/// Implemented by whatever owns the control-plane UDP socket. `send_map_request`
/// is fire-and-forget: the core itself drives retry scheduling (component D),
/// so the collaborator does not need wire-level retry policy.
pub trait ControlPlane {
    fn send_map_request(&self, requested_eid: IpPrefix, source_eid: Option<IpAddress>, nonce: u32);
}

/// A control plane that only logs -- used where no real wire codec is wired
/// up yet (e.g. unit tests, or a daemon running without control-plane
/// connectivity).
#[derive(Debug, Default)]
pub struct LoggingControlPlane;

impl ControlPlane for LoggingControlPlane {
    fn send_map_request(&self, requested_eid: IpPrefix, source_eid: Option<IpAddress>, nonce: u32) {
        tracing::debug!(
            eid = %requested_eid.address,
            len = requested_eid.length,
            source = ?source_eid.map(|a| a.to_string()),
            nonce,
            "send_map_request (no control-plane socket wired up)"
        );
    }
}
