//! Integration test suite for relay.
//!
//! These tests drive the public API end to end: a dispatch service with
//! delegate workers, the restraint engine under contention, task chains
//! against a stub delegate, and the governor's retry lineage.
//!
//! # Test Categories
//!
//! - `dispatch_protocol`: leasing, fencing, and delegate failure handling
//! - `restraint_admission`: capacity safety and FIFO grants
//! - `task_chain`: queue-then-poll chains over real workers
//! - `retry_lineage`: governor retries feeding back into chains

mod fixtures;

mod dispatch_protocol;
mod restraint_admission;
mod retry_lineage;
mod task_chain;
