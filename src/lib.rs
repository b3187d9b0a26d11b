pub mod chain;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod governor;
pub mod log;
pub mod queue;
pub mod restraint;
pub mod sim;
pub mod util;

pub use error::{Error, ErrorClass, Result};
