//! Descriptive statistics over latency samples

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mean, median and sample standard deviation of one sample set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatSummary {
    pub description: String,
    pub samples: usize,
    pub mean: f64,
    pub median: f64,
    /// Bessel-corrected (n - 1). Zero for a single sample.
    pub stddev: f64,
}

/// Summarize `numbers`. Input order is irrelevant; an empty input yields `None`.
pub fn summarize(description: impl Into<String>, numbers: &[f64]) -> Option<StatSummary> {
    if numbers.is_empty() {
        return None;
    }

    let mut sorted = numbers.to_vec();
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len();
    let mean = sorted.iter().sum::<f64>() / n as f64;

    let median = if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    };

    let stddev = if n > 1 {
        let variance_sum: f64 = sorted
            .iter()
            .map(|x| {
                let diff = x - mean;
                diff * diff
            })
            .sum();
        (variance_sum / (n - 1) as f64).sqrt()
    } else {
        0.0
    };

    Some(StatSummary {
        description: description.into(),
        samples: n,
        mean,
        median,
        stddev,
    })
}

/// Summarize whole-microsecond samples.
pub fn summarize_micros(description: impl Into<String>, micros: &[u64]) -> Option<StatSummary> {
    let numbers: Vec<f64> = micros.iter().map(|&m| m as f64).collect();
    summarize(description, &numbers)
}

/// Summarize each group separately, in ascending key order.
///
/// Items whose key is `None` are left out. `describe` names each group's summary.
pub fn summarize_grouped<T, K, FK, FV, FD>(
    items: &[T],
    key: FK,
    value: FV,
    describe: FD,
) -> Vec<StatSummary>
where
    K: Ord,
    FK: Fn(&T) -> Option<K>,
    FV: Fn(&T) -> f64,
    FD: Fn(&K) -> String,
{
    let mut groups: BTreeMap<K, Vec<f64>> = BTreeMap::new();
    for item in items {
        if let Some(k) = key(item) {
            groups.entry(k).or_default().push(value(item));
        }
    }

    groups
        .into_iter()
        .filter_map(|(k, numbers)| summarize(describe(&k), &numbers))
        .collect()
}
