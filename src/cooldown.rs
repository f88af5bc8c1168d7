//! Route-level cooldown — suppress repeatedly-failing routes with
//! escalating backoff.
//!
//! Purpose:
//!     Prevents the engine from re-attempting the same dead route (one
//!     that keeps losing the depth check or network selector) every
//!     single cycle. Structurally dead routes quickly reach the max
//!     cooldown while legitimate transient failures recover in a few
//!     cycles.
//!
//! Design:
//!     - Route key: (asset, buy_venue, sell_venue)
//!     - Escalating backoff: initial → 5x → 5x → cap
//!     - On success: entry removed (instant reset)
//!     - Periodic cleanup removes expired entries to bound memory

use std::collections::HashMap;
use tracing::{debug, info};

type RouteKey = (String, String, String);

struct CooldownEntry {
    last_failed_cycle: u64,
    cooldown_cycles: u64,
    failure_count: u32,
}

/// Cycle-indexed, escalating-backoff suppression table. Indexed by
/// scheduler cycle number rather than block height, since this engine
/// has no chain-native clock to key off of.
pub struct RouteCooldown {
    entries: HashMap<RouteKey, CooldownEntry>,
    initial_cooldown: u64,
    max_cooldown: u64,
}

const ESCALATION_FACTOR: u64 = 5;
const DEFAULT_MAX_COOLDOWN_CYCLES: u64 = 1800;

impl RouteCooldown {
    /// `initial_cooldown` = cycles to suppress after first failure (0 =
    /// disabled).
    pub fn new(initial_cooldown: u64) -> Self {
        Self {
            entries: HashMap::new(),
            initial_cooldown,
            max_cooldown: DEFAULT_MAX_COOLDOWN_CYCLES,
        }
    }

    pub fn is_cooled_down(
        &self,
        asset: &str,
        buy_venue: &str,
        sell_venue: &str,
        current_cycle: u64,
    ) -> bool {
        if self.initial_cooldown == 0 {
            return false;
        }
        let key = (asset.to_string(), buy_venue.to_string(), sell_venue.to_string());
        if let Some(entry) = self.entries.get(&key) {
            let expires_at = entry.last_failed_cycle + entry.cooldown_cycles;
            current_cycle < expires_at
        } else {
            false
        }
    }

    /// Escalation: initial x 5^(failures-1), capped at max.
    pub fn record_failure(&mut self, asset: &str, buy_venue: &str, sell_venue: &str, cycle: u64) {
        if self.initial_cooldown == 0 {
            return;
        }
        let key = (asset.to_string(), buy_venue.to_string(), sell_venue.to_string());
        let entry = self.entries.entry(key).or_insert_with(|| CooldownEntry {
            last_failed_cycle: cycle,
            cooldown_cycles: 0,
            failure_count: 0,
        });

        entry.failure_count += 1;
        entry.last_failed_cycle = cycle;

        let escalated = self
            .initial_cooldown
            .saturating_mul(ESCALATION_FACTOR.saturating_pow(entry.failure_count.saturating_sub(1)));
        entry.cooldown_cycles = escalated.min(self.max_cooldown);

        debug!(
            asset, buy_venue, sell_venue,
            failure = entry.failure_count, cooldown_cycles = entry.cooldown_cycles,
            "route cooldown escalated"
        );
    }

    /// Instant reset on a successful execution over this route.
    pub fn record_success(&mut self, asset: &str, buy_venue: &str, sell_venue: &str) {
        let key = (asset.to_string(), buy_venue.to_string(), sell_venue.to_string());
        if self.entries.remove(&key).is_some() {
            info!(asset, buy_venue, sell_venue, "route cooldown reset after successful trade");
        }
    }

    /// Remove expired entries to bound memory usage. Call once per cycle.
    pub fn cleanup(&mut self, current_cycle: u64) {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| current_cycle < entry.last_failed_cycle + entry.cooldown_cycles);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "route cooldown cleanup removed expired entries");
        }
    }

    pub fn active_count(&self) -> usize {
        self.entries.len()
    }
}
