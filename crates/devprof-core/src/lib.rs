//! # devprof-core
//!
//! Building blocks of the devprof measurement core that do not touch the
//! network:
//!
//! - **Process control**: spawn the dev server, interrupt it, await its exit
//! - **Timing**: monotonic, whole-microsecond elapsed samples
//! - **Statistics**: mean / median / sample standard deviation
//! - **Data model**: rebuild and page-load samples
//! - **Errors**: the fatal error taxonomy shared by every crate

pub mod config;
pub mod error;
pub mod process;
pub mod sample;
pub mod stats;
pub mod timer;

pub use config::ConfigError;
pub use error::{ProfileError, ProfileResult};
pub use process::{ExitInfo, LaunchSpec, ProcessController, TRACE_TARGET_ENV};
pub use sample::{PageLoadSample, Sample};
pub use stats::{StatSummary, summarize, summarize_grouped, summarize_micros};
pub use timer::{Clock, ElapsedTimer, ManualClock, Measure, MonotonicClock, measure};
