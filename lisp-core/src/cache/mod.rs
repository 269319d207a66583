//! Map-cache store (component C): a family-partitioned index from EID prefix
//! to cache entry supporting longest-prefix-match lookup.

pub mod handle;

use crate::address::{Family, IpAddress, IpPrefix};
use crate::control_plane::ControlPlane;
use crate::entry::{EntryConfig, EntryState, HowLearned, MapCacheEntry};
use crate::error::{LispError, Result};
use crate::mapping::Mapping;
use crate::metrics::Metrics;
use handle::CacheHandle;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};

type EntryRc = Rc<RefCell<MapCacheEntry>>;

/// Per-family table: prefix length -> (canonical network address -> entry).
/// Keyed on the integer form of the address so lookups are plain hash
/// lookups rather than pointer-chasing a bit-trie; longest-prefix-match
/// still runs in a bounded number of steps (at most the address width).
#[derive(Default)]
struct FamilyTable<K> {
    by_length: BTreeMap<u8, HashMap<K, EntryRc>>,
}

impl<K: std::hash::Hash + Eq + Copy> FamilyTable<K> {
    fn get(&self, length: u8, key: K) -> Option<&EntryRc> {
        self.by_length.get(&length)?.get(&key)
    }

    fn insert(&mut self, length: u8, key: K, entry: EntryRc) {
        self.by_length.entry(length).or_default().insert(key, entry);
    }

    fn remove(&mut self, length: u8, key: K) -> Option<EntryRc> {
        let removed = self.by_length.get_mut(&length)?.remove(&key);
        if matches!(self.by_length.get(&length), Some(m) if m.is_empty()) {
            self.by_length.remove(&length);
        }
        removed
    }

    fn iter(&self) -> impl Iterator<Item = &EntryRc> {
        self.by_length.values().flat_map(|m| m.values())
    }

    fn len(&self) -> usize {
        self.by_length.values().map(|m| m.len()).sum()
    }
}

/// Handle the store gives to entries so they can remove themselves on
/// expiry without the store holding a strong cycle back to them.
struct StoreHandle(Weak<RefCell<MapCacheStore>>);

impl CacheHandle for StoreHandle {
    fn remove(&self, prefix: &IpPrefix) {
        if let Some(store) = self.0.upgrade() {
            store.borrow_mut().remove(prefix);
        }
    }
}

pub struct MapCacheStore {
    v4: FamilyTable<u32>,
    v6: FamilyTable<u128>,
    generation: u64,
    control_plane: Rc<dyn ControlPlane>,
    entry_config: EntryConfig,
    metrics: Rc<Metrics>,
    self_ref: Weak<RefCell<MapCacheStore>>,
}

impl MapCacheStore {
    pub fn new(
        control_plane: Rc<dyn ControlPlane>,
        entry_config: EntryConfig,
        metrics: Rc<Metrics>,
    ) -> Rc<RefCell<MapCacheStore>> {
        Rc::new_cyclic(|self_ref| {
            RefCell::new(MapCacheStore {
                v4: FamilyTable::default(),
                v6: FamilyTable::default(),
                generation: 0,
                control_plane,
                entry_config,
                metrics,
                self_ref: self_ref.clone(),
            })
        })
    }

    fn cache_handle(&self) -> Rc<dyn CacheHandle> {
        Rc::new(StoreHandle(self.self_ref.clone()))
    }

    pub fn len(&self, family: Family) -> usize {
        match family {
            Family::V4 => self.v4.len(),
            Family::V6 => self.v6.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.v4.len() == 0 && self.v6.len() == 0
    }

    /// Inserts a mapping. If a canonically-equal prefix already exists, its
    /// mapping is replaced in place (idempotent under equal prefix);
    /// otherwise a new entry is created -- PENDING for dynamic, STATIC (and
    /// already active) for static.
    pub fn insert(&mut self, mapping: Mapping, how_learned: HowLearned) -> Result<EntryRc> {
        let normalized = mapping.eid_prefix.normalize()?;
        self.generation += 1;

        if let Some(existing) = self.lookup_exact(&normalized) {
            existing.borrow_mut().replace_mapping(Mapping { eid_prefix: normalized, ..mapping });
            return Ok(existing);
        }

        let mut mapping = mapping;
        mapping.eid_prefix = normalized;

        let entry = match how_learned {
            HowLearned::Dynamic => MapCacheEntry::new_dynamic(
                mapping,
                None,
                self.control_plane.clone(),
                self.cache_handle(),
                self.entry_config,
                self.metrics.clone(),
            ),
            HowLearned::Static => MapCacheEntry::new_static(
                mapping,
                self.cache_handle(),
                self.control_plane.clone(),
                self.entry_config,
                self.metrics.clone(),
            ),
        };
        self.insert_into_table(&normalized, entry.clone());
        Ok(entry)
    }

    /// Like [`Self::insert`] but records the EID that triggered the miss, so
    /// an SMR reply later can be attributed (§4.D "requester").
    pub fn insert_pending_for_miss(&mut self, prefix: IpPrefix, requester: IpAddress, instance_id: u32) -> Result<EntryRc> {
        let normalized = prefix.normalize()?;
        self.generation += 1;
        if let Some(existing) = self.lookup_exact(&normalized) {
            return Ok(existing);
        }
        let mapping = Mapping::negative(normalized, instance_id);
        let entry = MapCacheEntry::new_dynamic(
            mapping,
            Some(requester),
            self.control_plane.clone(),
            self.cache_handle(),
            self.entry_config,
            self.metrics.clone(),
        );
        self.insert_into_table(&normalized, entry.clone());
        Ok(entry)
    }

    fn insert_into_table(&mut self, normalized: &IpPrefix, entry: EntryRc) {
        match normalized.address {
            IpAddress::V4(addr) => self.v4.insert(normalized.length, addr, entry),
            IpAddress::V6(addr) => self.v6.insert(normalized.length, addr, entry),
        }
    }

    pub fn lookup_exact(&self, prefix: &IpPrefix) -> Option<EntryRc> {
        let normalized = prefix.normalize().ok()?;
        match normalized.address {
            IpAddress::V4(addr) => self.v4.get(normalized.length, addr).cloned(),
            IpAddress::V6(addr) => self.v6.get(normalized.length, addr).cloned(),
        }
    }

    /// Longest-prefix-match: walks prefix lengths from the address width
    /// down to zero and returns the first (therefore longest) hit. Insertion
    /// canonicalizes prefixes, so at most one entry can match at any given
    /// length.
    pub fn lookup_longest(&self, address: &IpAddress) -> Option<EntryRc> {
        match *address {
            IpAddress::V4(addr) => {
                for length in (0..=32u8).rev() {
                    let mask: u32 = if length == 0 { 0 } else { 0xFFFF_FFFFu32 << (32 - length) };
                    if let Some(entry) = self.v4.get(length, addr & mask) {
                        return Some(entry.clone());
                    }
                }
                None
            }
            IpAddress::V6(addr) => {
                for length in (0..=128u8).rev() {
                    let masked = mask_v6(addr, length);
                    if let Some(entry) = self.v6.get(length, masked) {
                        return Some(entry.clone());
                    }
                }
                None
            }
        }
    }

    /// Removes the entry at `prefix`, cancelling its timers first.
    pub fn remove(&mut self, prefix: &IpPrefix) -> Option<EntryRc> {
        let normalized = prefix.normalize().ok()?;
        self.generation += 1;
        let removed = match normalized.address {
            IpAddress::V4(addr) => self.v4.remove(normalized.length, addr),
            IpAddress::V6(addr) => self.v6.remove(normalized.length, addr),
        };
        if let Some(entry) = &removed {
            entry.borrow_mut().cancel_all_timers();
        }
        removed
    }

    /// Upward `on_map_reply` entry point (component E/F collaborator
    /// contract): looks the prefix up and dispatches to the matching entry's
    /// `on_reply`. A wire-codec collaborator only has the EID prefix to hand
    /// back, not the entry handle, so this does the lookup on its behalf.
    /// No-op if no entry exists for the prefix.
    pub fn on_map_reply(self_rc: &Rc<RefCell<MapCacheStore>>, requested_eid_prefix: IpPrefix, mapping: Mapping, nonce: u32, ttl_secs: u32) {
        let entry = self_rc.borrow().lookup_exact(&requested_eid_prefix);
        if let Some(entry) = entry {
            MapCacheEntry::on_reply(&entry, nonce, mapping, ttl_secs);
        }
    }

    /// Upward `on_smr` entry point, mirroring [`Self::on_map_reply`]'s
    /// lookup-then-dispatch shape.
    pub fn on_smr(self_rc: &Rc<RefCell<MapCacheStore>>, prefix: IpPrefix) {
        let entry = self_rc.borrow().lookup_exact(&prefix);
        if let Some(entry) = entry {
            MapCacheEntry::on_smr(&entry);
        }
    }

    /// Stable, one-shot traversal. Fails with `ConcurrentModification` if the
    /// visitor mutates the store (insert/remove) for the same family while
    /// iterating.
    ///
    /// Takes the store's own `Rc<RefCell<_>>` rather than `&self` so the
    /// snapshot can be taken and the borrow released *before* the visitor
    /// runs -- a visitor that reaches back into the same store (the
    /// realistic case this guards against) must be able to borrow it.
    pub fn iterate<F: FnMut(&EntryRc)>(self_rc: &Rc<RefCell<MapCacheStore>>, family: Family, mut visitor: F) -> Result<()> {
        let (snapshot, start_generation) = {
            let this = self_rc.borrow();
            let snapshot: Vec<EntryRc> = match family {
                Family::V4 => this.v4.iter().cloned().collect(),
                Family::V6 => this.v6.iter().cloned().collect(),
            };
            (snapshot, this.generation)
        };
        for entry in &snapshot {
            visitor(entry);
            if self_rc.borrow().generation != start_generation {
                return Err(LispError::ConcurrentModification);
            }
        }
        Ok(())
    }
}

fn mask_v6(addr: u128, length: u8) -> u128 {
    if length == 0 {
        0
    } else if length >= 128 {
        addr
    } else {
        addr & (u128::MAX << (128 - length))
    }
}
