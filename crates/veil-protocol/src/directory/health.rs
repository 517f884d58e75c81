//! Trust bookkeeping and stale-relay eviction.
//!
//! Trust moves by fixed steps: a successful probe earns a little, a failed
//! probe costs five times as much. Scores never leave [0, 1].

use std::collections::{HashMap, HashSet};

use crate::directory::RelayNodeInfo;
use crate::types::RelayId;

/// Trust earned by a successful probe.
pub const TRUST_INCREMENT: f64 = 0.01;

/// Trust lost by a failed probe.
pub const TRUST_DECREMENT: f64 = 0.05;

/// Record a successful probe.
pub fn record_probe_success(relay: &mut RelayNodeInfo, latency_ms: u64, now: u64) {
    relay.latency_ms = latency_ms;
    relay.online = true;
    relay.last_seen = now;
    relay.trust_score = (relay.trust_score + TRUST_INCREMENT).min(1.0);
}

/// Record a failed probe. `last_seen` is left alone so staleness keeps ticking.
pub fn record_probe_failure(relay: &mut RelayNodeInfo) {
    relay.online = false;
    relay.trust_score = (relay.trust_score - TRUST_DECREMENT).max(0.0);
}

/// Drop non-bootstrap relays unseen for longer than `threshold_ms`;
/// bootstrap relays only go offline. Returns how many were removed.
pub fn evict_stale(
    relays: &mut HashMap<RelayId, RelayNodeInfo>,
    bootstrap: &HashSet<RelayId>,
    now: u64,
    threshold_ms: u64,
) -> usize {
    let before = relays.len();
    relays.retain(|id, relay| {
        if now.saturating_sub(relay.last_seen) <= threshold_ms {
            return true;
        }
        if bootstrap.contains(id) {
            relay.online = false;
            return true;
        }
        false
    });
    before - relays.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RelayRole;

    fn relay(seed: u8, trust: f64, last_seen: u64) -> RelayNodeInfo {
        let mut r = RelayNodeInfo::new(vec![seed; 16], "wss://r", vec![RelayRole::Any])
            .with_trust(trust);
        r.last_seen = last_seen;
        r
    }

    #[test]
    fn success_raises_trust_and_marks_online() {
        let mut r = relay(1, 0.5, 0);
        r.online = false;
        record_probe_success(&mut r, 42, 1_000);
        assert!((r.trust_score - 0.51).abs() < 1e-9);
        assert!(r.online);
        assert_eq!(r.latency_ms, 42);
        assert_eq!(r.last_seen, 1_000);
    }

    #[test]
    fn failure_lowers_trust_and_marks_offline() {
        let mut r = relay(1, 0.5, 7);
        record_probe_failure(&mut r);
        assert!((r.trust_score - 0.45).abs() < 1e-9);
        assert!(!r.online);
        assert_eq!(r.last_seen, 7);
    }

    #[test]
    fn trust_is_clamped() {
        let mut high = relay(1, 0.995, 0);
        record_probe_success(&mut high, 1, 1);
        assert_eq!(high.trust_score, 1.0);

        let mut low = relay(2, 0.02, 0);
        record_probe_failure(&mut low);
        assert_eq!(low.trust_score, 0.0);
    }

    #[test]
    fn eviction_spares_bootstrap_relays() {
        let fresh = relay(1, 0.5, 9_500);
        let stale = relay(2, 0.5, 1_000);
        let stale_bootstrap = relay(3, 0.5, 1_000);

        let bootstrap: HashSet<RelayId> = [stale_bootstrap.id.clone()].into_iter().collect();
        let mut relays: HashMap<RelayId, RelayNodeInfo> =
            [fresh.clone(), stale.clone(), stale_bootstrap.clone()]
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect();

        let removed = evict_stale(&mut relays, &bootstrap, 10_000, 5_000);

        assert_eq!(removed, 1);
        assert!(relays.contains_key(&fresh.id));
        assert!(relays[&fresh.id].online);
        assert!(!relays.contains_key(&stale.id));
        assert!(!relays[&stale_bootstrap.id].online);
    }
}
