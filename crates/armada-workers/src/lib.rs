//! armada-workers — bounded fan-out with first-error short-circuit.
//!
//! The package compiler and the job updater both push many blocking work
//! units through a `WorkerPool`: at most K run at once, the first failure
//! stops further scheduling while in-flight units run to completion, and a
//! tripped `CancelToken` short-circuits the same way.

pub mod cancel;
pub mod pool;

pub use cancel::CancelToken;
pub use pool::WorkerPool;
