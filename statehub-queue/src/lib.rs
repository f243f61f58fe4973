//! Update queue for statehub.
//!
//! [`UpdateQueue`] orders update requests by priority then arrival, merges
//! queued updates to the same key, groups them into batches and applies
//! them through an [`UpdateExecutor`] under a concurrency cap, retrying
//! transient failures with capped exponential backoff. Every finished
//! dispatch unit is announced as a [`DispatchReport`].
//!
//! [`RegistryExecutor`] is the executor that applies requests to a
//! `StateRegistry`, validating them first.

mod error;
mod executor;
mod queue;
mod request;
mod state;

pub use error::{QueueError, QueueResult};
pub use executor::{ExecuteError, RegistryExecutor, UpdateExecutor};
pub use queue::{QueueConfig, QueueStats, UpdateQueue};
pub use request::{CancelCallback, DispatchReport, FailedUpdate, UpdateRequest};
