//! UUID-backed identifiers.
//!
//! Every id is a v4 UUID newtype with a short display form for log lines.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// First 8 characters of the UUID.
            pub fn short(&self) -> String {
                self.0.to_string()[..8].to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// A unit of work in the task queue.
    TaskId
);
uuid_id!(
    /// A remote worker process.
    DelegateId
);
uuid_id!(
    /// One node execution of a logical workflow step.
    ExecutionId
);
uuid_id!(
    /// A granted resource restraint usage record.
    UsageId
);
uuid_id!(
    /// A RETRY or ABORT interrupt issued by the governor.
    InterruptId
);
