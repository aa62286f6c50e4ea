//! Pending-action queue: typed deferred mutations and the processor that
//! replays them when connectivity returns.

mod action;
mod processor;

pub use action::{PendingAction, QueuedAction, RemoteMethod, RemoteRequest, SupportLevel};
pub use processor::{DrainReport, DrainSkip, QueueProcessor, QueueState, Submission};
