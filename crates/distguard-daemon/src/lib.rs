//! distguard-daemon - scheduled verification of one host
//!
//! - [`runner`]: the scheduler loop and its watchdog
//! - [`trigger`]: force and system-only flag files
//! - [`sink`]: report delivery

pub mod runner;
pub mod sink;
pub mod trigger;

pub use runner::{Runner, RunnerContext, RunnerError};
pub use sink::{JsonFileSink, LogSink, ReportSink, SinkError};
pub use trigger::TriggerFiles;
