//! Multi-round task chains: one logical step, several delegate round-trips.

mod controller;
pub mod poll;
pub mod state;
pub mod step;

pub use controller::{PendingStep, TaskChainController};
pub use poll::{JobState, QueueThenPoll};
pub use state::{ChainPhase, TaskChainState};
pub use step::{
    ChainHandle, FileLogSink, LogSink, NoopLogSink, StepContext, StepOutcome, StepStatus,
    TaskChainStep,
};
