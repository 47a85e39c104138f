//! The endpoint-configuration cache.
//!
//! Endpoints sharing a selection key share one configuration record and
//! carry only the small index. The table is append-only and bounded so
//! that indices fit the 8 bits every endpoint reserves for them; an index,
//! once returned, stays valid and equal-keyed for the worker's life.

use crate::tl::{IfaceLimits, RscIndex};
use crate::worker::{EpConfigIndex, IfaceSlot};

/// Upper bound of the table for a worker over `num_tls` resources.
///
/// Generous for any legitimate lane combination while keeping the index in
/// one byte.
pub(crate) fn table_bound(num_tls: usize) -> usize {
    (num_tls * num_tls * num_tls + 16).min(255)
}

/// The selection tuple deduplicating endpoint configurations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpConfigKey {
    /// Resource carrying active messages.
    pub am_lane: RscIndex,
    /// Resources carrying atomics, as a bitmask over resource indices.
    pub amo_lanes: u64,
    /// Resource the wire-up protocol runs on.
    pub wireup_lane: RscIndex,
    /// Payload size up to which the inline send path is used.
    pub short_thresh: usize,
}

impl EpConfigKey {
    /// The key of an endpoint whose lanes all ride `rsc`.
    pub fn for_am_lane(rsc: RscIndex, atomic_tls: u64, limits: &IfaceLimits) -> Self {
        EpConfigKey {
            am_lane: rsc,
            amo_lanes: atomic_tls,
            wireup_lane: rsc,
            short_thresh: limits.max_am_short,
        }
    }
}

/// Per-key derived state, filled once when the key is first inserted.
pub(crate) struct EpConfig {
    pub key: EpConfigKey,
    /// Scratch-path ceiling on the AM lane.
    pub max_bcopy: usize,
    pub max_short: usize,
}

pub(crate) struct EpConfigTable {
    entries: Vec<EpConfig>,
    bound: usize,
}

impl EpConfigTable {
    pub fn new(bound: usize) -> Self {
        EpConfigTable {
            entries: Vec::new(),
            bound,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Find the entry equal to `key` or append a new one.
    ///
    /// The table is sized so that legitimate workloads cannot fill it;
    /// running into the bound is a programming error and aborts.
    pub fn get_or_insert(&mut self, key: &EpConfigKey, ifaces: &[IfaceSlot]) -> EpConfigIndex {
        if let Some(index) = self.entries.iter().position(|entry| entry.key == *key) {
            return EpConfigIndex(index as u8);
        }
        assert!(
            self.entries.len() < self.bound,
            "endpoint configuration table overflow ({} entries)",
            self.bound,
        );

        let limits = ifaces
            .get(usize::from(key.am_lane.0))
            .map(|slot| slot.caps.limits)
            .unwrap_or_default();
        self.entries.push(EpConfig {
            key: key.clone(),
            max_bcopy: limits.max_am_bcopy,
            max_short: limits.max_am_short.min(key.short_thresh),
        });
        EpConfigIndex((self.entries.len() - 1) as u8)
    }

    pub fn get(&self, index: EpConfigIndex) -> Option<&EpConfig> {
        self.entries.get(usize::from(index.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(lane: u8, amo: u64) -> EpConfigKey {
        EpConfigKey {
            am_lane: RscIndex(lane),
            amo_lanes: amo,
            wireup_lane: RscIndex(lane),
            short_thresh: 128,
        }
    }

    #[test]
    fn equal_keys_share_an_index() {
        let mut table = EpConfigTable::new(8);
        let first = table.get_or_insert(&key(0, 1), &[]);
        let second = table.get_or_insert(&key(1, 1), &[]);
        assert_ne!(first, second);
        assert_eq!(table.get_or_insert(&key(0, 1), &[]), first);
        assert_eq!(table.get_or_insert(&key(1, 1), &[]), second);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(first).map(|entry| &entry.key), Some(&key(0, 1)));
    }

    #[test]
    #[should_panic(expected = "configuration table overflow")]
    fn exceeding_the_bound_is_fatal() {
        let mut table = EpConfigTable::new(2);
        table.get_or_insert(&key(0, 0), &[]);
        table.get_or_insert(&key(1, 0), &[]);
        table.get_or_insert(&key(2, 0), &[]);
    }

    #[test]
    fn bound_is_capped_at_one_byte() {
        assert_eq!(table_bound(1), 17);
        assert_eq!(table_bound(4), 80);
        assert_eq!(table_bound(16), 255);
    }
}
