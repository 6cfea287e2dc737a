//! Long-running agent runs.
//!
//! - `JobHandle`, `PollSnapshot`: state of one polled operation
//! - `JobPoller`: samples run status until a terminal state or cancellation

pub mod model;
pub mod poller;

pub use model::{
    JobHandle, JobStatus, OperationId, PollSnapshot, RunStarted, RunStatusResponse,
    DEFAULT_FAILURE_MESSAGE,
};
pub use poller::{JobPoller, PollerConfig, RunStatusSource, StartOutcome};
