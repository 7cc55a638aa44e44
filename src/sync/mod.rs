//! Concurrency primitives shared by the pool, session and binding layers.

mod context;
mod delay;
mod reference_counted;
mod semaphore;
mod state;

pub use context::{calculate_remaining_timeout, OperationContext};
pub use delay::{DelayOutcome, InterruptibleDelay};
pub use reference_counted::{ReferenceCounted, SharedHandle};
pub use semaphore::{SignalableSemaphore, WaitError, WaitResult};
pub use state::{AtomicState, GenerationCounter, StateValue};
