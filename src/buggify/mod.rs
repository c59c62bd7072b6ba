//! BUGGIFY - Seeded Fault Injection
//!
//! Every decision point that talks to the outside world (object store puts,
//! upstream reads) can be a fault injection site. Given the same RNG seed,
//! faults trigger at exactly the same points, so a failing simulation seed
//! replays deterministically.
//!
//! # Usage
//!
//! ```ignore
//! use crate::buggify::faults::object_store;
//!
//! // Configured probability from the thread's FaultConfig
//! if buggify!(&mut rng, object_store::PUT_TRANSIENT) {
//!     return Err(ObjectStoreError::Transient("injected".into()));
//! }
//!
//! // Explicit probability override
//! if buggify!(&mut rng, object_store::THROTTLE, 0.10) {
//!     return Err(ObjectStoreError::Throttled("injected".into()));
//! }
//! ```

pub mod config;
pub mod faults;

pub use config::FaultConfig;
pub use faults::ALL_FAULTS;

use std::cell::RefCell;
use std::collections::HashMap;

/// Statistics tracking for fault injection
#[derive(Debug, Clone, Default)]
pub struct BuggifyStats {
    /// Number of times each fault was checked
    pub checks: HashMap<String, u64>,
    /// Number of times each fault was triggered
    pub triggers: HashMap<String, u64>,
}

impl BuggifyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_check(&mut self, fault_id: &str) {
        *self.checks.entry(fault_id.to_string()).or_insert(0) += 1;
    }

    pub fn record_trigger(&mut self, fault_id: &str) {
        *self.triggers.entry(fault_id.to_string()).or_insert(0) += 1;
    }

    pub fn trigger_count(&self, fault_id: &str) -> u64 {
        self.triggers.get(fault_id).copied().unwrap_or(0)
    }

    pub fn trigger_rate(&self, fault_id: &str) -> f64 {
        let checks = self.checks.get(fault_id).copied().unwrap_or(0);
        if checks == 0 {
            0.0
        } else {
            self.trigger_count(fault_id) as f64 / checks as f64
        }
    }

    pub fn summary(&self) -> String {
        let mut lines = vec!["BUGGIFY Statistics:".to_string()];

        let mut sorted_faults: Vec<_> = self.checks.keys().collect();
        sorted_faults.sort();

        for fault_id in sorted_faults {
            let checks = self.checks.get(fault_id).copied().unwrap_or(0);
            lines.push(format!(
                "  {}: {}/{} ({:.2}%)",
                fault_id,
                self.trigger_count(fault_id),
                checks,
                self.trigger_rate(fault_id) * 100.0
            ));
        }

        lines.join("\n")
    }
}

thread_local! {
    static BUGGIFY_CONTEXT: RefCell<BuggifyContext> = RefCell::new(BuggifyContext::default());
}

/// Per-thread buggify context
#[derive(Debug, Default)]
struct BuggifyContext {
    config: FaultConfig,
    stats: BuggifyStats,
    /// When true, all buggify calls return false
    suppressed: bool,
}

/// Set the buggify configuration for the current thread
pub fn set_config(config: FaultConfig) {
    BUGGIFY_CONTEXT.with(|ctx| {
        ctx.borrow_mut().config = config;
    });
}

/// Get current buggify stats for the thread
pub fn get_stats() -> BuggifyStats {
    BUGGIFY_CONTEXT.with(|ctx| ctx.borrow().stats.clone())
}

/// Reset stats for the current thread
pub fn reset_stats() {
    BUGGIFY_CONTEXT.with(|ctx| {
        ctx.borrow_mut().stats = BuggifyStats::new();
    });
}

/// Suppresses buggify on this thread until dropped
pub struct BuggifySuppressor;

impl BuggifySuppressor {
    pub fn new() -> Self {
        BUGGIFY_CONTEXT.with(|ctx| {
            ctx.borrow_mut().suppressed = true;
        });
        BuggifySuppressor
    }
}

impl Default for BuggifySuppressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BuggifySuppressor {
    fn drop(&mut self) {
        BUGGIFY_CONTEXT.with(|ctx| {
            ctx.borrow_mut().suppressed = false;
        });
    }
}

fn roll<R: crate::io::Rng>(rng: &mut R, fault_id: &str, probability: f64) -> bool {
    BUGGIFY_CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        ctx.stats.record_check(fault_id);

        if ctx.suppressed || !ctx.config.enabled || probability <= 0.0 {
            return false;
        }

        let random_value = rng.gen_range(0, 1_000_000) as f64 / 1_000_000.0;
        let triggered = random_value < probability.clamp(0.0, 1.0);
        if triggered {
            ctx.stats.record_trigger(fault_id);
        }
        triggered
    })
}

/// Core buggify check using the thread's configured probability
#[inline]
pub fn should_buggify<R: crate::io::Rng>(rng: &mut R, fault_id: &str) -> bool {
    let prob = BUGGIFY_CONTEXT.with(|ctx| ctx.borrow().config.get(fault_id));
    roll(rng, fault_id, prob)
}

/// Check buggify with custom probability override
#[inline]
pub fn should_buggify_with_prob<R: crate::io::Rng>(
    rng: &mut R,
    fault_id: &str,
    probability: f64,
) -> bool {
    roll(rng, fault_id, probability)
}

/// BUGGIFY macro - the main interface for fault injection
#[macro_export]
macro_rules! buggify {
    ($rng:expr, $fault_id:expr) => {
        $crate::buggify::should_buggify($rng, $fault_id)
    };
    ($rng:expr, $fault_id:expr, $prob:expr) => {
        $crate::buggify::should_buggify_with_prob($rng, $fault_id, $prob)
    };
}

/// Suppress all buggify calls within a scope
#[macro_export]
macro_rules! suppress_buggify {
    () => {
        $crate::buggify::BuggifySuppressor::new()
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;

    #[test]
    fn test_buggify_disabled() {
        set_config(FaultConfig::disabled());
        let mut rng = SimulatedRng::new(1);

        for _ in 0..1000 {
            assert!(!buggify!(&mut rng, faults::object_store::PUT_TRANSIENT, 1.0));
        }
        set_config(FaultConfig::new());
    }

    #[test]
    fn test_buggify_with_prob() {
        set_config(FaultConfig::new());
        let mut rng = SimulatedRng::new(2);

        let always = (0..100)
            .filter(|_| buggify!(&mut rng, "test.always", 1.0))
            .count();
        assert_eq!(always, 100);

        let never = (0..100)
            .filter(|_| buggify!(&mut rng, "test.never", 0.0))
            .count();
        assert_eq!(never, 0);
    }

    #[test]
    fn test_buggify_stats() {
        reset_stats();
        set_config(FaultConfig::moderate());
        let mut rng = SimulatedRng::new(3);

        for _ in 0..1000 {
            let _ = buggify!(&mut rng, faults::object_store::PUT_TRANSIENT);
        }

        let stats = get_stats();
        assert_eq!(
            stats.checks.get(faults::object_store::PUT_TRANSIENT),
            Some(&1000)
        );
        // ~1% configured
        let triggers = stats.trigger_count(faults::object_store::PUT_TRANSIENT);
        assert!(triggers > 0 && triggers < 100, "triggers: {}", triggers);
        set_config(FaultConfig::new());
    }

    #[test]
    fn test_buggify_suppression() {
        set_config(FaultConfig::new());
        let mut rng = SimulatedRng::new(4);

        {
            let _guard = suppress_buggify!();
            for _ in 0..100 {
                assert!(!buggify!(&mut rng, faults::object_store::THROTTLE, 1.0));
            }
        }

        assert!(buggify!(&mut rng, "test.after_suppress", 1.0));
    }
}
