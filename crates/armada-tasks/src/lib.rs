//! armada-tasks — the asynchronous task framework.
//!
//! Every mutating API call becomes a durable task: a row in the state
//! store, a directory of log streams, and an entry on the durable queue.
//! Worker loops pick entries up with a conditional `queued → processing`
//! transition (so at-least-once delivery stays exactly-once in effect),
//! run the registered handler for the task's kind, and record the outcome.
//! Cancellation is cooperative: the API flips the row to `cancelling`, a
//! monitor trips the body's `CancelToken`, and the next suspension-point
//! check raises.

pub mod handler;
pub mod logger;
pub mod manager;
pub mod worker;

pub use handler::{HandlerRegistry, TaskContext, TaskHandler};
pub use logger::TaskLogger;
pub use manager::TaskManager;
pub use worker::TaskWorker;
