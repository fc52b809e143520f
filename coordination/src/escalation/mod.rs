//! Escalation module for advancing incidents through their policies
//!
//! Three layers, each usable on its own:
//! - [`TargetResolver`]: step target to user IDs
//! - [`EscalationExecutor`]: one step for one incident, under the per-incident lock
//! - [`BatchProcessor`]: every due incident, sequentially, failures isolated

pub mod batch;
pub mod executor;
pub mod outcome;
pub mod resolver;

pub use batch::{BatchProcessor, BatchReport};
pub use executor::{EscalationExecutor, ExecutorConfig};
pub use outcome::{EscalationError, EscalationOutcome, EscalationRunner};
pub use resolver::TargetResolver;
