//! I/O Abstractions
//!
//! Randomness goes through the [`Rng`] trait so fault injection and workload
//! generation run deterministically from a seed.

pub mod simulation;

pub use simulation::SimulatedRng;

/// Source of randomness used by fault injection and workload generators
pub trait Rng: Send + 'static {
    /// Next raw 64-bit value
    fn next_u64(&mut self) -> u64;

    /// True with the given probability (clamped to 0.0..=1.0)
    fn gen_bool(&mut self, probability: f64) -> bool;

    /// Uniform value in `min..max`; returns `min` when the range is empty
    fn gen_range(&mut self, min: u64, max: u64) -> u64;
}
