//! Measurement data model

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One rebuild cycle: change applied, "building" observed, "built" observed.
///
/// Both elapsed values are measured from the same start point, so
/// `complete_elapsed_micros >= notify_elapsed_micros` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    /// 1-based, restarts for each dimension
    pub iteration: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_file: Option<PathBuf>,
    pub notify_elapsed_micros: u64,
    pub complete_elapsed_micros: u64,
}

/// One page request timed from first attempt to fully drained body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageLoadSample {
    pub iteration: u32,
    pub elapsed_micros: u64,
    pub response_length: usize,
    /// Failed connection attempts before the server answered
    pub retries: u32,
}
