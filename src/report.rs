//! Session report: persisted JSON plus the console summary

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use devprof_core::{
    PageLoadSample, ProfileResult, Sample, StatSummary, summarize_grouped, summarize_micros,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Everything one session measured
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub generated_at: DateTime<Utc>,
    pub page: String,
    /// Cold start: process launch to first fully drained page response
    pub first_page_load_micros: u64,
    pub second_page_load_micros: u64,
    pub page_loads: Vec<PageLoadSample>,
    /// Rebuild samples in encounter order
    pub samples: Vec<Sample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traces: Option<Vec<Value>>,
}

impl SessionReport {
    /// Write the report as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> ProfileResult<()> {
        let content = serde_json::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> ProfileResult<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Samples from automatic mode, where notify latency was measured.
    fn notify_samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter().filter(|s| s.dimension.is_some())
    }

    /// Human-readable summary, one line per entry.
    ///
    /// Notify figures are only reported for automatically triggered
    /// rebuilds; in manual mode the timer starts at the notification.
    pub fn stat_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("cold start time: {}", format_micros(self.first_page_load_micros as f64)),
            format!("page load (second): {}", format_micros(self.second_page_load_micros as f64)),
        ];

        let page_loads: Vec<u64> = self.page_loads.iter().map(|p| p.elapsed_micros).collect();
        push_summary(&mut lines, summarize_micros("page load", &page_loads));

        let notify: Vec<u64> = self.notify_samples().map(|s| s.notify_elapsed_micros).collect();
        push_summary(&mut lines, summarize_micros("notify", &notify));
        push_ordinals(&mut lines, "notify", &notify);
        for summary in summarize_grouped(
            &self.samples,
            |s| s.dimension,
            |s| s.notify_elapsed_micros as f64,
            |d| format!("notify (dimension {d})"),
        ) {
            push_summary(&mut lines, Some(summary));
        }

        let complete: Vec<u64> = self.samples.iter().map(|s| s.complete_elapsed_micros).collect();
        push_summary(&mut lines, summarize_micros("complete", &complete));
        push_ordinals(&mut lines, "complete", &complete);
        for summary in summarize_grouped(
            &self.samples,
            |s| s.dimension,
            |s| s.complete_elapsed_micros as f64,
            |d| format!("complete (dimension {d})"),
        ) {
            push_summary(&mut lines, Some(summary));
        }

        lines
    }
}

fn push_summary(lines: &mut Vec<String>, summary: Option<StatSummary>) {
    let Some(s) = summary else {
        return;
    };
    lines.push(format!("{}, mean: {}", s.description, format_micros(s.mean)));
    lines.push(format!("{}, median: {}", s.description, format_micros(s.median)));
    lines.push(format!("{}, stddev: {}", s.description, format_micros(s.stddev)));
}

fn push_ordinals(lines: &mut Vec<String>, label: &str, values: &[u64]) {
    for (ordinal, value) in ["first", "second"].iter().zip(values) {
        lines.push(format!("{label} ({ordinal}): {}", format_micros(*value as f64)));
    }
}

/// Whole microseconds with thousands separators, e.g. `1,234 μs`.
///
/// Fractions are truncated toward zero.
pub fn format_micros(micros: f64) -> String {
    let whole = micros.trunc() as i64;
    let digits = whole.unsigned_abs().to_string();

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    let sign = if whole < 0 { "-" } else { "" };
    format!("{sign}{grouped} μs")
}
