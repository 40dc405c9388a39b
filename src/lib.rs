//! # devprof
//!
//! Measures how a JavaScript dev server behaves during development: cold
//! start, repeated page loads, and the latency of rebuilds triggered by
//! file changes, observed through the server's change-notification stream.
//!
//! ```no_run
//! use devprof::{MeasurementSession, SessionConfig, SessionMode};
//!
//! # async fn run() -> devprof::ProfileResult<()> {
//! let config = SessionConfig::builder()
//!     .page("/")
//!     .mode(SessionMode::Auto {
//!         targets: vec!["components/index.tsx".into()],
//!         iterations: 10,
//!     })
//!     .build()?;
//!
//! let report = MeasurementSession::new(config).run().await?;
//! for line in report.stat_lines() {
//!     println!("{line}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod mutation;
pub mod report;
pub mod session;

pub use config::{SessionConfig, SessionConfigBuilder, SessionMode};
pub use devprof_core::{ProfileError, ProfileResult, Sample, StatSummary};
pub use mutation::{ChangeTrigger, Commit, NonceMutator};
pub use report::{SessionReport, format_micros};
pub use session::{BUILDING, BUILT, CyclePhase, MeasurementSession, RebuildCycle};
