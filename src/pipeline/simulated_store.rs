//! Simulated Object Store with Fault Injection
//!
//! DST-compatible wrapper around another [`ObjectStore`] that injects
//! transient failures, throttling, timeouts, permanent failures and latency
//! using buggify and a seeded RNG.
//!
//! Besides the probabilistic faults, two deterministic knobs make targeted
//! tests possible:
//! - `fail_first_attempts`: the first N puts of every key fail transiently
//! - `permanent_failure_prefixes`: puts under these prefixes always fail

use crate::buggify::faults::object_store as faults;
use crate::io::Rng;
use crate::pipeline::object_store::{ObjectMeta, ObjectStore, ObjectStoreError, StoreFuture};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// Probability of a retryable PUT failure
    pub put_transient_prob: f64,
    /// Probability of a throttling response
    pub throttle_prob: f64,
    /// Probability of operation timeout
    pub timeout_prob: f64,
    /// Probability of a non-retryable PUT failure
    pub put_permanent_prob: f64,
    /// Probability of GET failure
    pub get_fail_prob: f64,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
    /// First N puts of each key fail transiently
    pub fail_first_attempts: u32,
    /// Puts whose key starts with one of these always fail permanently
    pub permanent_failure_prefixes: Vec<String>,
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            put_transient_prob: 0.02,
            throttle_prob: 0.01,
            timeout_prob: 0.005,
            put_permanent_prob: 0.0,
            get_fail_prob: 0.01,
            latency_range_us: (100, 5_000),
            fail_first_attempts: 0,
            permanent_failure_prefixes: Vec::new(),
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing (still retryable only)
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            put_transient_prob: 0.10,
            throttle_prob: 0.05,
            timeout_prob: 0.05,
            get_fail_prob: 0.05,
            latency_range_us: (1_000, 20_000),
            ..Self::default()
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            put_transient_prob: 0.0,
            throttle_prob: 0.0,
            timeout_prob: 0.0,
            put_permanent_prob: 0.0,
            get_fail_prob: 0.0,
            latency_range_us: (0, 0),
            fail_first_attempts: 0,
            permanent_failure_prefixes: Vec::new(),
        }
    }

    /// No random faults, only latency (reorders upload completions)
    pub fn latency_only(min_us: u64, max_us: u64) -> Self {
        SimulatedStoreConfig {
            latency_range_us: (min_us, max_us),
            ..Self::no_faults()
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedStoreStats {
    pub put_attempts: u64,
    pub put_successes: u64,
    pub transient_failures: u64,
    pub throttles: u64,
    pub timeouts: u64,
    pub permanent_failures: u64,
    pub get_attempts: u64,
    pub get_failures: u64,
}

struct SimulatedStoreInner<R: Rng> {
    rng: R,
    stats: SimulatedStoreStats,
    attempts_by_key: HashMap<String, u32>,
}

/// Fault outcome decided before touching the inner store
enum Injected {
    Fail(ObjectStoreError),
    Proceed { latency: Duration },
}

/// Simulated object store that wraps another store and injects faults
pub struct SimulatedObjectStore<S: ObjectStore, R: Rng> {
    inner_store: S,
    config: SimulatedStoreConfig,
    state: Arc<Mutex<SimulatedStoreInner<R>>>,
}

impl<S: ObjectStore + Clone, R: Rng> Clone for SimulatedObjectStore<S, R> {
    fn clone(&self) -> Self {
        SimulatedObjectStore {
            inner_store: self.inner_store.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
        }
    }
}

impl<S: ObjectStore, R: Rng> SimulatedObjectStore<S, R> {
    pub fn new(inner_store: S, rng: R, config: SimulatedStoreConfig) -> Self {
        SimulatedObjectStore {
            inner_store,
            config,
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng,
                stats: SimulatedStoreStats::default(),
                attempts_by_key: HashMap::new(),
            })),
        }
    }

    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.state.lock().stats = SimulatedStoreStats::default();
    }

    /// Access the wrapped store (bypasses fault injection)
    pub fn inner(&self) -> &S {
        &self.inner_store
    }

    fn pick_latency(&self, rng: &mut R) -> Duration {
        let (min, max) = self.config.latency_range_us;
        let us = if max > min { rng.gen_range(min, max) } else { min };
        Duration::from_micros(us)
    }

    /// All fault decisions for a put happen under one lock acquisition
    fn decide_put(&self, key: &str) -> Injected {
        let mut guard = self.state.lock();
        let s = &mut *guard;
        s.stats.put_attempts += 1;

        let attempt = s.attempts_by_key.entry(key.to_string()).or_insert(0);
        *attempt += 1;
        let attempt = *attempt;

        if self
            .config
            .permanent_failure_prefixes
            .iter()
            .any(|p| key.starts_with(p.as_str()))
        {
            s.stats.permanent_failures += 1;
            return Injected::Fail(ObjectStoreError::Permanent(format!(
                "simulated access denied for {}",
                key
            )));
        }

        if attempt <= self.config.fail_first_attempts {
            s.stats.transient_failures += 1;
            return Injected::Fail(ObjectStoreError::Transient(format!(
                "simulated connection reset (attempt {})",
                attempt
            )));
        }

        if crate::buggify!(&mut s.rng, faults::PUT_PERMANENT, self.config.put_permanent_prob) {
            s.stats.permanent_failures += 1;
            return Injected::Fail(ObjectStoreError::Permanent(
                "simulated invalid destination".to_string(),
            ));
        }
        if crate::buggify!(&mut s.rng, faults::TIMEOUT, self.config.timeout_prob) {
            s.stats.timeouts += 1;
            return Injected::Fail(ObjectStoreError::Transient("simulated timeout".to_string()));
        }
        if crate::buggify!(&mut s.rng, faults::THROTTLE, self.config.throttle_prob) {
            s.stats.throttles += 1;
            return Injected::Fail(ObjectStoreError::Throttled("simulated SlowDown".to_string()));
        }
        if crate::buggify!(&mut s.rng, faults::PUT_TRANSIENT, self.config.put_transient_prob) {
            s.stats.transient_failures += 1;
            return Injected::Fail(ObjectStoreError::Transient(
                "simulated put failure".to_string(),
            ));
        }

        let latency = self.pick_latency(&mut s.rng);
        Injected::Proceed { latency }
    }

    fn decide_get(&self) -> Injected {
        let mut guard = self.state.lock();
        let s = &mut *guard;
        s.stats.get_attempts += 1;
        if crate::buggify!(&mut s.rng, faults::GET_FAIL, self.config.get_fail_prob) {
            s.stats.get_failures += 1;
            return Injected::Fail(ObjectStoreError::Transient(
                "simulated get failure".to_string(),
            ));
        }
        let latency = self.pick_latency(&mut s.rng);
        Injected::Proceed { latency }
    }
}

impl<S: ObjectStore, R: Rng> ObjectStore for SimulatedObjectStore<S, R> {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let latency = match self.decide_put(key) {
                Injected::Fail(e) => return Err(e),
                Injected::Proceed { latency } => latency,
            };
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            self.inner_store.put(key, data).await?;
            self.state.lock().stats.put_successes += 1;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let latency = match self.decide_get() {
                Injected::Fail(e) => return Err(e),
                Injected::Proceed { latency } => latency,
            };
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            self.inner_store.get(key).await
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        self.inner_store.exists(key)
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        self.inner_store.delete(key)
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        self.inner_store.list(prefix)
    }

    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
        self.inner_store.head(key)
    }
}
