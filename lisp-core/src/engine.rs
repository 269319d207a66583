//! Egress classification and encapsulation engine (component F).

use crate::address::{Family, IpAddress};
use crate::cache::MapCacheStore;
use crate::eid_db::LocalEidDb;
use crate::entry::EntryState;
use crate::error::{LispError, Result};
use crate::mapping::Locator;
use crate::metrics::Metrics;
use crate::packet::{encapsulate_v4, PacketView};
use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;

/// LISP data-plane UDP port (RFC 9300).
pub const LISP_DATA_PORT: u16 = 4341;

/// LISP control-plane UDP port (RFC 9300). Traffic already on either LISP
/// port is left native rather than re-encapsulated.
pub const LISP_CONTROL_PORT: u16 = 4342;

/// Where encapsulated (and, for non-EID sources, native) packets get written.
/// The real implementation wraps a raw socket; tests use an in-memory sink.
pub trait UnderlaySink {
    fn send(&self, bytes: &[u8]) -> Result<()>;
}

pub struct EgressEngineConfig {
    pub local_rloc: Ipv4Addr,
    pub proxy_etr: Option<Ipv4Addr>,
    pub instance_id: u32,
}

/// Drives the per-packet decision procedure: parse, classify, resolve,
/// encapsulate, emit. One instance is shared (via `Rc`) across the
/// single-threaded local task set; it holds no packet state between calls.
pub struct EgressEngine {
    store: Rc<RefCell<MapCacheStore>>,
    eid_db: Rc<dyn LocalEidDb>,
    sink: Rc<dyn UnderlaySink>,
    metrics: Rc<Metrics>,
    config: EgressEngineConfig,
}

impl EgressEngine {
    pub fn new(
        store: Rc<RefCell<MapCacheStore>>,
        eid_db: Rc<dyn LocalEidDb>,
        sink: Rc<dyn UnderlaySink>,
        metrics: Rc<Metrics>,
        config: EgressEngineConfig,
    ) -> Self {
        Self { store, eid_db, sink, metrics, config }
    }

    /// Classifies and forwards one outbound packet. Never panics on
    /// malformed input -- parse failures are counted and dropped.
    pub fn handle_outbound(&self, packet: &[u8]) {
        let view = match PacketView::new(packet) {
            Ok(v) => v,
            Err(err) => {
                self.metrics.parse_failures_total.add(1, &[]);
                tracing::debug!(error = %err, "dropping packet that failed to parse");
                return;
            }
        };

        if view.family().unwrap_or(Family::V4) != Family::V4 {
            // IPv6 outer encapsulation is an explicit extension point, not
            // yet implemented; IPv6-in-IPv6 traffic passes through natively
            // rather than being silently dropped.
            self.forward_native(packet, "ipv6 outer encapsulation not implemented");
            return;
        }

        if self.is_lisp_data_traffic(&view) {
            self.forward_native(packet, "already LISP-encapsulated, avoiding double encapsulation");
            return;
        }

        let source = match view.source_address() {
            Ok(a) => a,
            Err(err) => {
                self.metrics.parse_failures_total.add(1, &[]);
                tracing::debug!(error = %err, "dropping packet with unreadable source address");
                return;
            }
        };
        if !self.eid_db.is_local_eid(&source) {
            self.forward_native(packet, "source is not a local EID");
            return;
        }

        let destination = match view.destination_address() {
            Ok(a) => a,
            Err(err) => {
                self.metrics.parse_failures_total.add(1, &[]);
                tracing::debug!(error = %err, "dropping packet with unreadable destination address");
                return;
            }
        };

        let tos = view.tos().unwrap_or(0);
        let ttl = view.ttl().unwrap_or(64);

        let hit = self.store.borrow().lookup_longest(&destination);
        let locator = hit.as_ref().and_then(|entry| {
            let e = entry.borrow();
            if e.state() == EntryState::Active {
                e.mapping().best_locator(Family::V4).copied().map(|locator| (locator, e.mapping().instance_id))
            } else {
                None
            }
        });

        match locator {
            Some((locator, instance_id)) => self.encapsulate_and_emit(packet, tos, ttl, &locator, instance_id),
            None => {
                if hit.is_none() {
                    self.store
                        .borrow_mut()
                        .insert_pending_for_miss(
                            crate::address::IpPrefix::new(destination, destination.width()).unwrap(),
                            source,
                            self.config.instance_id,
                        )
                        .ok();
                }
                self.forward_to_petr(packet, tos, ttl);
            }
        }
    }

    fn is_lisp_data_traffic(&self, view: &PacketView<'_>) -> bool {
        let is_lisp_port = |port: u16| port == LISP_DATA_PORT || port == LISP_CONTROL_PORT;
        matches!(view.udp_ports(), Ok(Some((src, dst))) if is_lisp_port(src) || is_lisp_port(dst))
    }

    fn forward_native(&self, packet: &[u8], reason: &'static str) {
        tracing::info!(reason, "forwarding packet natively");
        self.metrics.packets_forwarded_native_total.add(1, &[]);
        if let Err(err) = self.sink.send(packet) {
            self.metrics.emission_failures_total.add(1, &[]);
            tracing::error!(error = %err, "native forward failed");
        }
    }

    fn forward_to_petr(&self, packet: &[u8], tos: u8, ttl: u8) {
        let Some(petr) = self.config.proxy_etr else {
            self.forward_native(packet, "no proxy ETR configured");
            return;
        };
        tracing::debug!(%petr, "forwarding to proxy ETR pending map-cache resolution");
        self.metrics.packets_forwarded_petr_total.add(1, &[]);
        // PETR traffic always carries instance-id 0, regardless of the
        // daemon's configured tenant id -- the mapping that would have
        // carried a real iid hasn't resolved yet.
        match encapsulate_v4(packet, tos, ttl, self.config.local_rloc, petr, LISP_DATA_PORT, LISP_DATA_PORT, 0u32) {
            Ok(encapsulated) => {
                if let Err(err) = self.sink.send(&encapsulated) {
                    self.metrics.emission_failures_total.add(1, &[]);
                    tracing::error!(error = %err, "proxy ETR emission failed, forwarding natively");
                    self.forward_native(packet, "proxy ETR emission failed");
                }
            }
            Err(err) => {
                self.metrics.emission_failures_total.add(1, &[]);
                tracing::error!(error = %err, "failed to encapsulate for proxy ETR, forwarding natively");
                self.forward_native(packet, "proxy ETR encapsulation failed");
            }
        }
    }

    fn encapsulate_and_emit(&self, packet: &[u8], tos: u8, ttl: u8, locator: &Locator, instance_id: u32) {
        let IpAddress::V4(rloc) = locator.address else {
            // Mixed-family RLOCs for a V4 EID are a config error, not a data-plane one.
            self.metrics.packets_dropped_total.add(1, &[]);
            tracing::warn!("selected locator is not IPv4, dropping");
            return;
        };
        let dst = Ipv4Addr::from(rloc);
        match encapsulate_v4(packet, tos, ttl, self.config.local_rloc, dst, LISP_DATA_PORT, LISP_DATA_PORT, instance_id) {
            Ok(encapsulated) => {
                self.metrics.packets_encapsulated_total.add(1, &[]);
                tracing::info!(%dst, instance_id, "encapsulated and emitted");
                if let Err(err) = self.sink.send(&encapsulated) {
                    self.metrics.emission_failures_total.add(1, &[]);
                    tracing::error!(error = %err, "emission failed, forwarding natively");
                    self.forward_native(packet, "emission failed");
                }
            }
            Err(err) => {
                self.metrics.emission_failures_total.add(1, &[]);
                tracing::error!(error = %err, "encapsulation failed, forwarding natively");
                self.forward_native(packet, "encapsulation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::LoggingControlPlane;
    use crate::eid_db::{EidSnapshot, SwappableEidDb};
    use crate::entry::EntryConfig;
    use opentelemetry::global;
    use std::cell::RefCell as StdRefCell;

    struct RecordingSink {
        sent: StdRefCell<Vec<Vec<u8>>>,
    }

    impl UnderlaySink for RecordingSink {
        fn send(&self, bytes: &[u8]) -> Result<()> {
            self.sent.borrow_mut().push(bytes.to_vec());
            Ok(())
        }
    }

    fn test_metrics() -> Rc<Metrics> {
        Rc::new(Metrics::new(global::meter("lisp-core-tests")))
    }

    fn sample_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut pkt = vec![0u8; 28];
        pkt[0] = (4 << 4) | 5;
        pkt[8] = 64;
        pkt[9] = 17;
        pkt[12..16].copy_from_slice(&src);
        pkt[16..20].copy_from_slice(&dst);
        pkt[20..22].copy_from_slice(&12345u16.to_be_bytes());
        pkt[22..24].copy_from_slice(&53u16.to_be_bytes());
        pkt
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn non_local_source_forwards_natively() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let store = MapCacheStore::new(Rc::new(LoggingControlPlane), EntryConfig::default(), test_metrics());
                let eid_db: Rc<dyn LocalEidDb> = Rc::new(SwappableEidDb::new(EidSnapshot::default()));
                let sink = Rc::new(RecordingSink { sent: StdRefCell::new(Vec::new()) });
                let engine = EgressEngine::new(
                    store,
                    eid_db,
                    sink.clone(),
                    test_metrics(),
                    EgressEngineConfig { local_rloc: "192.0.2.1".parse().unwrap(), proxy_etr: None, instance_id: 0 },
                );
                let pkt = sample_packet([1, 2, 3, 4], [5, 6, 7, 8]);
                engine.handle_outbound(&pkt);
                assert_eq!(sink.sent.borrow().len(), 1);
                assert_eq!(sink.sent.borrow()[0], pkt);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn local_source_with_cache_miss_goes_to_petr() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let store = MapCacheStore::new(Rc::new(LoggingControlPlane), EntryConfig::default(), test_metrics());
                let prefix = crate::address::IpPrefix::new("10.0.0.0".parse::<Ipv4Addr>().unwrap().into(), 8).unwrap();
                let eid_db: Rc<dyn LocalEidDb> = Rc::new(SwappableEidDb::new(EidSnapshot::from_prefixes(&[prefix])));
                let sink = Rc::new(RecordingSink { sent: StdRefCell::new(Vec::new()) });
                let engine = EgressEngine::new(
                    store.clone(),
                    eid_db,
                    sink.clone(),
                    test_metrics(),
                    EgressEngineConfig {
                        local_rloc: "192.0.2.1".parse().unwrap(),
                        proxy_etr: Some("192.0.2.254".parse().unwrap()),
                        instance_id: 0,
                    },
                );
                let pkt = sample_packet([10, 1, 2, 3], [5, 6, 7, 8]);
                engine.handle_outbound(&pkt);
                assert_eq!(sink.sent.borrow().len(), 1, "should have been sent to PETR");
                assert!(store.borrow().lookup_longest(&"5.6.7.8".parse::<Ipv4Addr>().unwrap().into()).is_some());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn local_source_with_cache_miss_and_no_petr_forwards_natively() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let store = MapCacheStore::new(Rc::new(LoggingControlPlane), EntryConfig::default(), test_metrics());
                let prefix = crate::address::IpPrefix::new("10.0.0.0".parse::<Ipv4Addr>().unwrap().into(), 8).unwrap();
                let eid_db: Rc<dyn LocalEidDb> = Rc::new(SwappableEidDb::new(EidSnapshot::from_prefixes(&[prefix])));
                let sink = Rc::new(RecordingSink { sent: StdRefCell::new(Vec::new()) });
                let engine = EgressEngine::new(
                    store,
                    eid_db,
                    sink.clone(),
                    test_metrics(),
                    EgressEngineConfig { local_rloc: "192.0.2.1".parse().unwrap(), proxy_etr: None, instance_id: 0 },
                );
                let pkt = sample_packet([10, 1, 2, 3], [5, 6, 7, 8]);
                engine.handle_outbound(&pkt);
                assert_eq!(sink.sent.borrow().len(), 1, "should have been forwarded natively");
                assert_eq!(sink.sent.borrow()[0], pkt);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn lisp_data_port_traffic_passes_through() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let store = MapCacheStore::new(Rc::new(LoggingControlPlane), EntryConfig::default(), test_metrics());
                let eid_db: Rc<dyn LocalEidDb> = Rc::new(SwappableEidDb::new(EidSnapshot::default()));
                let sink = Rc::new(RecordingSink { sent: StdRefCell::new(Vec::new()) });
                let engine = EgressEngine::new(
                    store,
                    eid_db,
                    sink.clone(),
                    test_metrics(),
                    EgressEngineConfig { local_rloc: "192.0.2.1".parse().unwrap(), proxy_etr: None, instance_id: 0 },
                );
                let mut pkt = sample_packet([10, 1, 2, 3], [5, 6, 7, 8]);
                pkt[22..24].copy_from_slice(&LISP_DATA_PORT.to_be_bytes());
                engine.handle_outbound(&pkt);
                assert_eq!(sink.sent.borrow().len(), 1);
            })
            .await;
    }
}
