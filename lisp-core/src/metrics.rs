//! Telemetry counters for the egress engine and map-cache, mirroring the
//! struct-of-instruments style used elsewhere in the stack. No HTTP exporter
//! lives here -- standing up a `/metrics` endpoint is the ambient binary's
//! concern, not the core library's.

use opentelemetry::metrics::{Counter, Meter};

#[derive(Clone)]
pub struct Metrics {
    pub packets_forwarded_native_total: Counter<u64>,
    pub packets_encapsulated_total: Counter<u64>,
    pub packets_forwarded_petr_total: Counter<u64>,
    pub packets_dropped_total: Counter<u64>,
    pub parse_failures_total: Counter<u64>,
    pub emission_failures_total: Counter<u64>,
    pub map_requests_sent_total: Counter<u64>,
    pub map_replies_applied_total: Counter<u64>,
    pub map_reply_nonce_mismatches_total: Counter<u64>,
    pub retries_exhausted_total: Counter<u64>,
    pub smr_invalidations_total: Counter<u64>,
}

impl Metrics {
    pub fn new(meter: Meter) -> Self {
        Self {
            packets_forwarded_native_total: meter
                .u64_counter("lisp_packets_forwarded_native_total")
                .with_description("Packets forwarded unencapsulated because the source is not a local EID")
                .build(),
            packets_encapsulated_total: meter
                .u64_counter("lisp_packets_encapsulated_total")
                .with_description("Packets successfully LISP-encapsulated and emitted")
                .build(),
            packets_forwarded_petr_total: meter
                .u64_counter("lisp_packets_forwarded_petr_total")
                .with_description("Packets sent to the configured Proxy ETR on a cache miss or negative entry")
                .build(),
            packets_dropped_total: meter
                .u64_counter("lisp_packets_dropped_total")
                .with_description("Packets dropped by the egress engine")
                .build(),
            parse_failures_total: meter
                .u64_counter("lisp_parse_failures_total")
                .with_description("Packets that failed header parsing")
                .build(),
            emission_failures_total: meter
                .u64_counter("lisp_emission_failures_total")
                .with_description("Underlay sink writes that failed or returned a short write")
                .build(),
            map_requests_sent_total: meter
                .u64_counter("lisp_map_requests_sent_total")
                .with_description("Map-Request messages sent, including retries")
                .build(),
            map_replies_applied_total: meter
                .u64_counter("lisp_map_replies_applied_total")
                .with_description("Map-Reply messages that matched an outstanding nonce and were applied")
                .build(),
            map_reply_nonce_mismatches_total: meter
                .u64_counter("lisp_map_reply_nonce_mismatches_total")
                .with_description("Map-Reply messages discarded for an unknown or stale nonce")
                .build(),
            retries_exhausted_total: meter
                .u64_counter("lisp_retries_exhausted_total")
                .with_description("Map-cache entries that transitioned to NEGATIVE after exhausting retries")
                .build(),
            smr_invalidations_total: meter
                .u64_counter("lisp_smr_invalidations_total")
                .with_description("Solicit-Map-Request invalidations processed")
                .build(),
        }
    }
}
