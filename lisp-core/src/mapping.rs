//! EID-to-RLOC mapping data model (component shared by C and D).

use crate::address::{Family, IpAddress, IpPrefix};
use rand::Rng;

/// A single RLOC entry inside a [`Mapping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locator {
    pub address: IpAddress,
    pub priority: u8,
    pub weight: u8,
}

/// An EID prefix bound to zero or more locators, one list per family.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub eid_prefix: IpPrefix,
    pub instance_id: u32,
    pub locators_v4: Vec<Locator>,
    pub locators_v6: Vec<Locator>,
}

impl Mapping {
    pub fn negative(eid_prefix: IpPrefix, instance_id: u32) -> Self {
        Self { eid_prefix, instance_id, locators_v4: Vec::new(), locators_v6: Vec::new() }
    }

    pub fn locator_count(&self) -> usize {
        self.locators_v4.len() + self.locators_v6.len()
    }

    fn locators_for(&self, family: Family) -> &[Locator] {
        match family {
            Family::V4 => &self.locators_v4,
            Family::V6 => &self.locators_v6,
        }
    }

    /// Selects the locator of a given family with the lowest priority value.
    /// Among equal priorities, weight is a proportional selection hint; a
    /// deterministic lowest-index pick is used when weights are all zero or
    /// there is a single candidate.
    pub fn best_locator(&self, family: Family) -> Option<&Locator> {
        let candidates = self.locators_for(family);
        let min_priority = candidates.iter().map(|l| l.priority).min()?;
        let tied: Vec<&Locator> = candidates.iter().filter(|l| l.priority == min_priority).collect();
        if tied.len() == 1 {
            return Some(tied[0]);
        }
        let total_weight: u32 = tied.iter().map(|l| l.weight as u32).sum();
        if total_weight == 0 {
            return Some(tied[0]);
        }
        let mut roll = rand::thread_rng().gen_range(0..total_weight);
        for locator in &tied {
            let w = locator.weight as u32;
            if roll < w {
                return Some(locator);
            }
            roll -= w;
        }
        Some(tied[tied.len() - 1])
    }
}
