//! Alert cooldown gate.
//!
//! The only thing standing between a sustained detection and a flood of
//! duplicate evidence records. Each key remembers when it last opened; a new
//! trigger opens only once strictly more than the cooldown has passed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::detect::Category;

/// Whether categories cool down independently or share one timer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateScope {
    #[default]
    PerCategory,
    Global,
}

const GLOBAL_KEY: &str = "*";

pub struct AlertCooldownGate {
    cooldown: std::time::Duration,
    scope: GateScope,
    last_trigger: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AlertCooldownGate {
    pub fn new(cooldown: std::time::Duration, scope: GateScope) -> Self {
        Self {
            cooldown,
            scope,
            last_trigger: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> std::time::Duration {
        self.cooldown
    }

    pub fn scope(&self) -> GateScope {
        self.scope
    }

    /// Open the gate for `category` at `now`, recording the trigger time.
    ///
    /// The check and the update happen under one lock, so concurrent callers
    /// never both open for the same key. A clock that moved backwards counts as
    /// "not elapsed".
    pub fn try_trigger(&self, category: &Category, now: DateTime<Utc>) -> bool {
        let key = match self.scope {
            GateScope::PerCategory => category.as_str(),
            GateScope::Global => GLOBAL_KEY,
        };
        let mut last = match self.last_trigger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let open = match last.get(key) {
            None => true,
            Some(prev) => now
                .signed_duration_since(*prev)
                .to_std()
                .map(|elapsed| elapsed > self.cooldown)
                .unwrap_or(false),
        };
        if open {
            last.insert(key.to_string(), now);
        }
        open
    }

    /// Last time the gate opened for `category`, if ever.
    pub fn last_trigger(&self, category: &Category) -> Option<DateTime<Utc>> {
        let key = match self.scope {
            GateScope::PerCategory => category.as_str(),
            GateScope::Global => GLOBAL_KEY,
        };
        let last = match self.last_trigger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        last.get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn gate(scope: GateScope) -> AlertCooldownGate {
        AlertCooldownGate::new(std::time::Duration::from_secs(5), scope)
    }

    #[test]
    fn opens_once_per_window_then_again_after() {
        let g = gate(GateScope::PerCategory);
        let firearm = Category::new("firearm");
        let t0 = Utc::now();
        assert!(g.try_trigger(&firearm, t0));
        assert!(!g.try_trigger(&firearm, t0 + Duration::seconds(1)));
        assert!(g.try_trigger(&firearm, t0 + Duration::seconds(6)));
    }

    #[test]
    fn cooldown_boundary_is_exclusive() {
        let g = gate(GateScope::PerCategory);
        let blade = Category::new("blade");
        let t0 = Utc::now();
        assert!(g.try_trigger(&blade, t0));
        assert!(!g.try_trigger(&blade, t0 + Duration::seconds(5)));
        assert!(g.try_trigger(&blade, t0 + Duration::milliseconds(5001)));
    }

    #[test]
    fn rejected_trigger_does_not_extend_window() {
        let g = gate(GateScope::PerCategory);
        let firearm = Category::new("firearm");
        let t0 = Utc::now();
        assert!(g.try_trigger(&firearm, t0));
        assert!(!g.try_trigger(&firearm, t0 + Duration::seconds(4)));
        assert!(g.try_trigger(&firearm, t0 + Duration::seconds(6)));
        assert_eq!(g.last_trigger(&firearm), Some(t0 + Duration::seconds(6)));
    }

    #[test]
    fn categories_are_independent_unless_global() {
        let t0 = Utc::now();
        let firearm = Category::new("firearm");
        let blade = Category::new("blade");

        let per = gate(GateScope::PerCategory);
        assert!(per.try_trigger(&firearm, t0));
        assert!(per.try_trigger(&blade, t0));

        let global = gate(GateScope::Global);
        assert!(global.try_trigger(&firearm, t0));
        assert!(!global.try_trigger(&blade, t0));
    }

    #[test]
    fn backwards_clock_keeps_gate_closed() {
        let g = gate(GateScope::PerCategory);
        let firearm = Category::new("firearm");
        let t0 = Utc::now();
        assert!(g.try_trigger(&firearm, t0));
        assert!(!g.try_trigger(&firearm, t0 - Duration::seconds(60)));
    }

    #[test]
    fn concurrent_triggers_open_exactly_once() {
        let g = Arc::new(gate(GateScope::PerCategory));
        let now = Utc::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let g = Arc::clone(&g);
                std::thread::spawn(move || g.try_trigger(&Category::new("firearm"), now))
            })
            .collect();
        let opened = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|open| *open)
            .count();
        assert_eq!(opened, 1);
    }
}
