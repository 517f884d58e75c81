//! Relay scoring and candidate ranking.
//!
//! Score = 0.4·trust + 0.3·bandwidth factor + 0.3·latency factor, where
//! bandwidth saturates at 10 MB/s and latency reaches zero at 1 s.

use std::cmp::Ordering;

use crate::directory::RelayNodeInfo;
use crate::types::{RelayId, RelayRole};

pub const TRUST_WEIGHT: f64 = 0.4;
pub const BANDWIDTH_WEIGHT: f64 = 0.3;
pub const LATENCY_WEIGHT: f64 = 0.3;

/// Bandwidth at which the bandwidth factor saturates (10 MB/s).
pub const REFERENCE_BANDWIDTH: f64 = 10.0 * 1024.0 * 1024.0;

/// Latency at which the latency factor reaches zero.
pub const REFERENCE_LATENCY_MS: f64 = 1000.0;

/// Selection picks uniformly among this many best candidates.
pub const TOP_CANDIDATES: usize = 3;

/// What a caller needs from a relay.
#[derive(Debug, Clone)]
pub struct SelectionCriteria {
    pub role: RelayRole,
    pub exclude: Vec<RelayId>,
    pub min_bandwidth: Option<u64>,
    pub max_latency_ms: Option<u64>,
    /// Soft preference: only narrows the set if something matches.
    pub preferred_regions: Vec<String>,
}

impl SelectionCriteria {
    pub fn new(role: RelayRole) -> Self {
        Self {
            role,
            exclude: Vec::new(),
            min_bandwidth: None,
            max_latency_ms: None,
            preferred_regions: Vec::new(),
        }
    }

    pub fn exclude(mut self, ids: impl IntoIterator<Item = RelayId>) -> Self {
        self.exclude.extend(ids);
        self
    }

    pub fn min_bandwidth(mut self, bytes_per_sec: u64) -> Self {
        self.min_bandwidth = Some(bytes_per_sec);
        self
    }

    pub fn max_latency(mut self, latency_ms: u64) -> Self {
        self.max_latency_ms = Some(latency_ms);
        self
    }

    pub fn prefer_regions(mut self, regions: impl IntoIterator<Item = String>) -> Self {
        self.preferred_regions.extend(regions);
        self
    }
}

/// Weighted quality score in [0, 1].
pub fn score_relay(relay: &RelayNodeInfo) -> f64 {
    let bandwidth = (relay.bandwidth as f64 / REFERENCE_BANDWIDTH).min(1.0);
    let latency = (1.0 - relay.latency_ms as f64 / REFERENCE_LATENCY_MS).max(0.0);
    TRUST_WEIGHT * relay.trust_score + BANDWIDTH_WEIGHT * bandwidth + LATENCY_WEIGHT * latency
}

/// Eligible candidates, best first.
pub(crate) fn rank_candidates<'a>(
    relays: impl IntoIterator<Item = &'a RelayNodeInfo>,
    criteria: &SelectionCriteria,
) -> Vec<&'a RelayNodeInfo> {
    let mut candidates: Vec<&RelayNodeInfo> = relays
        .into_iter()
        .filter(|r| r.online)
        .filter(|r| r.has_role(criteria.role))
        .filter(|r| !criteria.exclude.contains(&r.id))
        .filter(|r| criteria.min_bandwidth.map_or(true, |min| r.bandwidth >= min))
        .filter(|r| criteria.max_latency_ms.map_or(true, |max| r.latency_ms <= max))
        .collect();

    if !criteria.preferred_regions.is_empty() {
        let preferred: Vec<&RelayNodeInfo> = candidates
            .iter()
            .copied()
            .filter(|r| criteria.preferred_regions.contains(&r.region))
            .collect();
        if !preferred.is_empty() {
            candidates = preferred;
        }
    }

    candidates.sort_by(|a, b| {
        score_relay(b)
            .partial_cmp(&score_relay(a))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    candidates
}

/// Slot roles of a `hop_count`-hop path: entry, middles, exit.
pub(crate) fn path_roles(hop_count: usize) -> Vec<RelayRole> {
    let mut roles = vec![RelayRole::Entry];
    if hop_count >= 2 {
        roles.extend(std::iter::repeat(RelayRole::Middle).take(hop_count - 2));
        roles.push(RelayRole::Exit);
    }
    roles
}

/// Whether every slot can be given a distinct relay able to fill it.
///
/// Bipartite matching by augmenting paths; relays with several roles
/// (or `any`) are moved between slots as needed.
pub(crate) fn slots_fillable(slots: &[RelayRole], relays: &[&RelayNodeInfo]) -> bool {
    if slots.len() > relays.len() {
        return false;
    }
    let mut owner: Vec<Option<usize>> = vec![None; relays.len()];
    (0..slots.len()).all(|slot| {
        let mut seen = vec![false; relays.len()];
        augment(slot, slots, relays, &mut owner, &mut seen)
    })
}

fn augment(
    slot: usize,
    slots: &[RelayRole],
    relays: &[&RelayNodeInfo],
    owner: &mut [Option<usize>],
    seen: &mut [bool],
) -> bool {
    for (r, relay) in relays.iter().enumerate() {
        if seen[r] || !relay.has_role(slots[slot]) {
            continue;
        }
        seen[r] = true;
        let free = match owner[r] {
            None => true,
            Some(other) => augment(other, slots, relays, owner, seen),
        };
        if free {
            owner[r] = Some(slot);
            return true;
        }
    }
    false
}

/// First slot, in path order, that cannot get its own relay.
pub(crate) fn first_unfillable(
    slots: &[RelayRole],
    relays: &[&RelayNodeInfo],
) -> Option<RelayRole> {
    (1..=slots.len())
        .find(|&n| !slots_fillable(&slots[..n], relays))
        .map(|n| slots[n - 1])
}

/// Unbiased index in `0..upper` from a source of random u32s.
///
/// Rejection sampling: draws at or above the largest multiple of `upper`
/// are discarded.
pub(crate) fn uniform_index(upper: usize, mut next_u32: impl FnMut() -> u32) -> usize {
    debug_assert!(upper > 0);
    let upper = upper as u64;
    let zone = (u32::MAX as u64 + 1) / upper * upper;
    loop {
        let draw = next_u32() as u64;
        if draw < zone {
            return (draw % upper) as usize;
        }
    }
}
