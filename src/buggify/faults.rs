//! Named fault-injection sites.
//!
//! Every fault ID is a dotted string so stats can be grouped by subsystem.

/// Faults injected by the simulated object store
pub mod object_store {
    /// PUT fails with a retryable network error
    pub const PUT_TRANSIENT: &str = "object_store.put_transient";
    /// PUT is rejected with a throttling signal (retryable)
    pub const THROTTLE: &str = "object_store.throttle";
    /// Operation times out (retryable)
    pub const TIMEOUT: &str = "object_store.timeout";
    /// PUT fails permanently (auth / invalid destination)
    pub const PUT_PERMANENT: &str = "object_store.put_permanent";
    /// GET fails with a retryable error
    pub const GET_FAIL: &str = "object_store.get_fail";
}

/// Faults injected into the ingestion path
pub mod pipeline {
    /// Upstream disconnects without an end-of-stream signal
    pub const UPSTREAM_DISCONNECT: &str = "pipeline.upstream_disconnect";
}

/// Every registered fault with its default probability
pub const ALL_FAULTS: &[(&str, f64)] = &[
    (object_store::PUT_TRANSIENT, 0.01),
    (object_store::THROTTLE, 0.005),
    (object_store::TIMEOUT, 0.005),
    (object_store::PUT_PERMANENT, 0.0),
    (object_store::GET_FAIL, 0.01),
    (pipeline::UPSTREAM_DISCONNECT, 0.0),
];
