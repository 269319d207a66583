//! Map-cache entry lifecycle (component D).

use crate::address::{IpAddress, IpPrefix};
use crate::cache::handle::CacheHandle;
use crate::control_plane::ControlPlane;
use crate::mapping::Mapping;
use crate::metrics::Metrics;
use crate::timer::{backoff_delay, TimerHandle};
use rand::Rng;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// Tuning knobs for retry/backoff/TTL behavior, overridable from
/// configuration; defaults match the values named in the core contract.
#[derive(Debug, Clone, Copy)]
pub struct EntryConfig {
    pub max_retries: u32,
    pub max_nonces: usize,
    pub negative_ttl: Duration,
    pub retry_exhausted_ttl: Duration,
    pub retry_base: Duration,
    pub retry_factor: u32,
    pub retry_cap: Duration,
    pub smr_inv_max_delay: Duration,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            max_nonces: 3,
            negative_ttl: Duration::from_secs(60),
            retry_exhausted_ttl: Duration::from_secs(15),
            retry_base: Duration::from_secs(1),
            retry_factor: 2,
            retry_cap: Duration::from_secs(30),
            smr_inv_max_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Active,
    Negative,
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HowLearned {
    Static,
    Dynamic,
}

pub struct MapCacheEntry {
    self_ref: Weak<RefCell<MapCacheEntry>>,
    mapping: Mapping,
    how_learned: HowLearned,
    state: EntryState,
    ttl: Duration,
    installed_at: Instant,
    nonces: VecDeque<u32>,
    retry_count: u32,
    requester: Option<IpAddress>,
    expiry_timer: Option<TimerHandle>,
    retry_timer: Option<TimerHandle>,
    smr_timer: Option<TimerHandle>,
    control_plane: Rc<dyn ControlPlane>,
    cache_handle: Rc<dyn CacheHandle>,
    config: EntryConfig,
    metrics: Rc<Metrics>,
}

fn fresh_nonce() -> u32 {
    rand::thread_rng().gen_range(0..=0x00FF_FFFF) // 24-bit nonce
}

impl MapCacheEntry {
    /// Creates a PENDING dynamic entry and immediately issues the first
    /// Map-Request (step 5 of the egress engine hands a freshly-created
    /// entry straight into this).
    pub fn new_dynamic(
        mapping: Mapping,
        requester: Option<IpAddress>,
        control_plane: Rc<dyn ControlPlane>,
        cache_handle: Rc<dyn CacheHandle>,
        config: EntryConfig,
        metrics: Rc<Metrics>,
    ) -> Rc<RefCell<MapCacheEntry>> {
        let entry = Rc::new_cyclic(|self_ref| {
            RefCell::new(MapCacheEntry {
                self_ref: self_ref.clone(),
                mapping,
                how_learned: HowLearned::Dynamic,
                state: EntryState::Pending,
                ttl: Duration::ZERO,
                installed_at: Instant::now(),
                nonces: VecDeque::new(),
                retry_count: 0,
                requester,
                expiry_timer: None,
                retry_timer: None,
                smr_timer: None,
                control_plane,
                cache_handle,
                config,
                metrics,
            })
        });
        MapCacheEntry::fire_request_retry(&entry);
        entry
    }

    /// Creates a STATIC entry: always active, never retried, no expiry.
    pub fn new_static(
        mapping: Mapping,
        cache_handle: Rc<dyn CacheHandle>,
        control_plane: Rc<dyn ControlPlane>,
        config: EntryConfig,
        metrics: Rc<Metrics>,
    ) -> Rc<RefCell<MapCacheEntry>> {
        Rc::new_cyclic(|self_ref| {
            RefCell::new(MapCacheEntry {
                self_ref: self_ref.clone(),
                mapping,
                how_learned: HowLearned::Static,
                state: EntryState::Static,
                ttl: Duration::ZERO,
                installed_at: Instant::now(),
                nonces: VecDeque::new(),
                retry_count: 0,
                requester: None,
                expiry_timer: None,
                retry_timer: None,
                smr_timer: None,
                control_plane,
                cache_handle,
                config,
                metrics,
            })
        })
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn how_learned(&self) -> HowLearned {
        self.how_learned
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn nonce_count(&self) -> usize {
        self.nonces.len()
    }

    pub fn requester(&self) -> Option<IpAddress> {
        self.requester
    }

    /// Replaces the mapping of an entry already present in the store (insert
    /// over an existing prefix is replace-in-place, not a new entry).
    pub fn replace_mapping(&mut self, mapping: Mapping) {
        self.mapping = mapping;
    }

    fn push_nonce(&mut self, nonce: u32) {
        if self.nonces.len() >= self.config.max_nonces {
            self.nonces.pop_front();
        }
        self.nonces.push_back(nonce);
    }

    /// A Map-Reply arrived for this entry's prefix, carrying `ttl_secs` as
    /// advertised on the wire (the wire codec is an out-of-scope
    /// collaborator; it hands the core a parsed mapping plus TTL). Returns
    /// `true` if the nonce matched the ledger and the reply was applied,
    /// `false` if the nonce is unknown (caller should log at debug and drop
    /// it silently).
    pub fn on_reply(self_rc: &Rc<RefCell<Self>>, nonce: u32, mapping: Mapping, ttl_secs: u32) -> bool {
        let mut this = self_rc.borrow_mut();
        if this.state != EntryState::Pending {
            return false;
        }
        if !this.nonces.contains(&nonce) {
            this.metrics.map_reply_nonce_mismatches_total.add(1, &[]);
            tracing::debug!(nonce, eid = %this.mapping.eid_prefix.address, "map-reply nonce mismatch");
            return false;
        }
        this.nonces.clear();
        this.retry_timer = None;
        let locator_count = mapping.locator_count();
        let prefix = mapping.eid_prefix;
        this.mapping = mapping;
        this.installed_at = Instant::now();
        this.ttl = if locator_count > 0 && ttl_secs > 0 {
            this.state = EntryState::Active;
            Duration::from_secs(ttl_secs as u64)
        } else {
            this.state = EntryState::Negative;
            this.config.negative_ttl
        };
        let ttl = this.ttl;
        let state = this.state;
        this.metrics.map_replies_applied_total.add(1, &[]);
        drop(this);
        if state == EntryState::Active {
            tracing::info!(eid = %prefix.address, len = prefix.length, locators = locator_count, "map-cache entry activated");
        }
        Self::arm_expiry(self_rc, ttl);
        true
    }

    fn arm_expiry(self_rc: &Rc<RefCell<Self>>, ttl: Duration) {
        let weak = Rc::downgrade(self_rc);
        let handle = TimerHandle::schedule(ttl, async move {
            if let Some(entry) = weak.upgrade() {
                Self::on_expiry(&entry);
            }
        });
        self_rc.borrow_mut().expiry_timer = Some(handle);
    }

    fn on_expiry(self_rc: &Rc<RefCell<Self>>) {
        let this = self_rc.borrow();
        if !matches!(this.state, EntryState::Active | EntryState::Negative) {
            return;
        }
        let prefix = this.mapping.eid_prefix;
        let cache_handle = this.cache_handle.clone();
        drop(this);
        tracing::debug!(eid = %prefix.address, len = prefix.length, "map-cache entry expired");
        cache_handle.remove(&prefix);
    }

    /// Arms (or re-arms) the request-retry timer and, for the very first
    /// call, sends the initial Map-Request synchronously.
    fn fire_request_retry(self_rc: &Rc<RefCell<Self>>) {
        let mut this = self_rc.borrow_mut();
        if this.state != EntryState::Pending {
            return;
        }
        if this.retry_count >= this.config.max_retries {
            this.state = EntryState::Negative;
            this.ttl = this.config.retry_exhausted_ttl;
            this.retry_timer = None;
            this.nonces.clear();
            let prefix = this.mapping.eid_prefix;
            let ttl = this.ttl;
            this.metrics.retries_exhausted_total.add(1, &[]);
            drop(this);
            tracing::warn!(eid = %prefix.address, len = prefix.length, "map-request retries exhausted");
            Self::arm_expiry(self_rc, ttl);
            return;
        }

        this.retry_count += 1;
        let nonce = fresh_nonce();
        this.push_nonce(nonce);
        let requested = this.mapping.eid_prefix;
        let requester = this.requester;
        let control_plane = this.control_plane.clone();
        let delay = backoff_delay(this.config.retry_base, this.config.retry_factor, this.config.retry_cap, this.retry_count);
        this.metrics.map_requests_sent_total.add(1, &[]);
        drop(this);

        control_plane.send_map_request(requested, requester, nonce);

        let weak = Rc::downgrade(self_rc);
        let handle = TimerHandle::schedule(delay, async move {
            if let Some(entry) = weak.upgrade() {
                Self::fire_request_retry(&entry);
            }
        });
        self_rc.borrow_mut().retry_timer = Some(handle);
    }

    /// Solicit-Map-Request arrived for an active entry: keep serving the
    /// current mapping, but schedule re-resolution after a randomized delay.
    pub fn on_smr(self_rc: &Rc<RefCell<Self>>) {
        let mut this = self_rc.borrow_mut();
        if this.state != EntryState::Active {
            return;
        }
        let delay = Duration::from_millis(rand::thread_rng().gen_range(0..=this.config.smr_inv_max_delay.as_millis() as u64));
        this.metrics.smr_invalidations_total.add(1, &[]);
        drop(this);

        let weak = Rc::downgrade(self_rc);
        let handle = TimerHandle::schedule(delay, async move {
            if let Some(entry) = weak.upgrade() {
                Self::on_smr_fire(&entry);
            }
        });
        self_rc.borrow_mut().smr_timer = Some(handle);
    }

    fn on_smr_fire(self_rc: &Rc<RefCell<Self>>) {
        let mut this = self_rc.borrow_mut();
        if this.state != EntryState::Active {
            return;
        }
        this.smr_timer = None;
        let nonce = fresh_nonce();
        this.push_nonce(nonce);
        let requested = this.mapping.eid_prefix;
        let requester = this.requester;
        let control_plane = this.control_plane.clone();
        this.metrics.map_requests_sent_total.add(1, &[]);
        drop(this);
        control_plane.send_map_request(requested, requester, nonce);
    }

    /// Explicit invalidation: back to PENDING regardless of current state,
    /// nonces cleared, expiry cancelled, request-retry armed immediately.
    pub fn invalidate(self_rc: &Rc<RefCell<Self>>) {
        {
            let mut this = self_rc.borrow_mut();
            this.state = EntryState::Pending;
            this.nonces.clear();
            this.retry_count = 0;
            this.expiry_timer = None;
            this.smr_timer = None;
        }
        Self::fire_request_retry(self_rc);
    }

    /// Cancels all three timers synchronously. Called explicitly by the
    /// store before an entry is removed, and implicitly on drop.
    pub fn cancel_all_timers(&mut self) {
        self.expiry_timer = None;
        self.retry_timer = None;
        self.smr_timer = None;
    }

    pub fn self_handle(&self) -> Option<Rc<RefCell<MapCacheEntry>>> {
        self.self_ref.upgrade()
    }
}

impl Drop for MapCacheEntry {
    fn drop(&mut self) {
        self.cancel_all_timers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::IpPrefix;
    use std::cell::Cell;
    use std::net::Ipv4Addr;

    struct RecordingControlPlane {
        requests: RefCell<Vec<(IpPrefix, u32)>>,
    }

    impl ControlPlane for RecordingControlPlane {
        fn send_map_request(&self, requested_eid: IpPrefix, _source_eid: Option<IpAddress>, nonce: u32) {
            self.requests.borrow_mut().push((requested_eid, nonce));
        }
    }

    struct NoopCacheHandle {
        removed: Rc<Cell<bool>>,
    }

    impl CacheHandle for NoopCacheHandle {
        fn remove(&self, _prefix: &IpPrefix) {
            self.removed.set(true);
        }
    }

    fn eid() -> IpPrefix {
        IpPrefix::new("5.6.7.8".parse::<Ipv4Addr>().unwrap().into(), 32).unwrap()
    }

    fn test_metrics() -> Rc<Metrics> {
        Rc::new(Metrics::new(opentelemetry::global::meter("lisp-core-entry-tests")))
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn creating_dynamic_entry_sends_first_request() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let cp = Rc::new(RecordingControlPlane { requests: RefCell::new(Vec::new()) });
                let handle = Rc::new(NoopCacheHandle { removed: Rc::new(Cell::new(false)) });
                let entry = MapCacheEntry::new_dynamic(
                    Mapping::negative(eid(), 0),
                    None,
                    cp.clone(),
                    handle,
                    EntryConfig::default(),
                    test_metrics(),
                );
                assert_eq!(entry.borrow().state(), EntryState::Pending);
                assert_eq!(cp.requests.borrow().len(), 1);
                assert_eq!(entry.borrow().nonce_count(), 1);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn reply_with_locators_activates_entry() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let cp = Rc::new(RecordingControlPlane { requests: RefCell::new(Vec::new()) });
                let handle = Rc::new(NoopCacheHandle { removed: Rc::new(Cell::new(false)) });
                let entry = MapCacheEntry::new_dynamic(
                    Mapping::negative(eid(), 0),
                    None,
                    cp.clone(),
                    handle,
                    EntryConfig::default(),
                    test_metrics(),
                );
                let nonce = cp.requests.borrow()[0].1;
                let mapping = Mapping {
                    eid_prefix: eid(),
                    instance_id: 42,
                    locators_v4: vec![crate::mapping::Locator {
                        address: "10.20.30.40".parse::<Ipv4Addr>().unwrap().into(),
                        priority: 1,
                        weight: 100,
                    }],
                    locators_v6: vec![],
                };
                let applied = MapCacheEntry::on_reply(&entry, nonce, mapping, 300);
                assert!(applied);
                assert_eq!(entry.borrow().state(), EntryState::Active);
                assert_eq!(entry.borrow().ttl(), Duration::from_secs(300));
                assert_eq!(entry.borrow().nonce_count(), 0);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn unknown_nonce_is_ignored() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let cp = Rc::new(RecordingControlPlane { requests: RefCell::new(Vec::new()) });
                let handle = Rc::new(NoopCacheHandle { removed: Rc::new(Cell::new(false)) });
                let entry = MapCacheEntry::new_dynamic(
                    Mapping::negative(eid(), 0),
                    None,
                    cp,
                    handle,
                    EntryConfig::default(),
                    test_metrics(),
                );
                let applied = MapCacheEntry::on_reply(&entry, 0xDEAD, Mapping::negative(eid(), 0), 60);
                assert!(!applied);
                assert_eq!(entry.borrow().state(), EntryState::Pending);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn retries_exhaust_to_negative() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let cp = Rc::new(RecordingControlPlane { requests: RefCell::new(Vec::new()) });
                let removed = Rc::new(Cell::new(false));
                let handle = Rc::new(NoopCacheHandle { removed: removed.clone() });
                let config = EntryConfig { max_retries: 2, ..EntryConfig::default() };
                let entry = MapCacheEntry::new_dynamic(
                    Mapping::negative(eid(), 0),
                    None,
                    cp.clone(),
                    handle,
                    config,
                    test_metrics(),
                );

                // first retry already fired synchronously in new_dynamic (retry_count=1)
                tokio::task::yield_now().await;
                tokio::time::advance(Duration::from_secs(2)).await;
                tokio::task::yield_now().await;
                tokio::time::advance(Duration::from_secs(5)).await;
                tokio::task::yield_now().await;

                assert_eq!(entry.borrow().state(), EntryState::Negative);
                assert_eq!(cp.requests.borrow().len(), 2);
            })
            .await;
    }

    #[test]
    fn nonce_ledger_is_bounded_by_max_nonces() {
        let config = EntryConfig { max_nonces: 3, max_retries: 10, ..EntryConfig::default() };
        let cp = Rc::new(RecordingControlPlane { requests: RefCell::new(Vec::new()) });
        let handle = Rc::new(NoopCacheHandle { removed: Rc::new(Cell::new(false)) });
        // constructed outside a LocalSet/tokio runtime: timers fail to spawn_local,
        // so we only exercise the pure ledger bookkeeping helper directly.
        let mut entry = MapCacheEntry {
            self_ref: Weak::new(),
            mapping: Mapping::negative(eid(), 0),
            how_learned: HowLearned::Dynamic,
            state: EntryState::Pending,
            ttl: Duration::ZERO,
            installed_at: Instant::now(),
            nonces: VecDeque::new(),
            retry_count: 0,
            requester: None,
            expiry_timer: None,
            retry_timer: None,
            smr_timer: None,
            control_plane: cp,
            cache_handle: handle,
            config,
            metrics: test_metrics(),
        };
        for n in 0..5u32 {
            entry.push_nonce(n);
        }
        assert_eq!(entry.nonce_count(), 3);
        assert_eq!(entry.nonces, VecDeque::from(vec![2, 3, 4]));
    }
}
