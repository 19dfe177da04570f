//! # Resilient Bus Test Suite
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── scenarios.rs   # Ordering, circuit breaking and retry budgets
//!     ├── flows.rs       # Pipeline, routing, bridge and batching end to end
//!     └── recovery.rs    # Dead letter reprocessing, breaker recovery, telemetry
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p rb-tests
//!
//! # By category
//! cargo test -p rb-tests integration::scenarios::
//!
//! # Benchmarks
//! cargo bench -p rb-tests
//! ```
