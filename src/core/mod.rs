//! Core domain models shared by the dispatch, restraint, chain, and
//! governor layers.

pub mod clock;
pub mod delegate;
pub mod ids;
pub mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use delegate::{Delegate, DelegateStatus, RegisterAck, RegisterRequest};
pub use ids::{DelegateId, ExecutionId, InterruptId, TaskId, UsageId};
pub use task::{
    ActivityEntry, Lease, Task, TaskKind, TaskNotification, TaskOutcome, TaskPackage,
    TaskRequest, TaskResponse, TaskStatus,
};
