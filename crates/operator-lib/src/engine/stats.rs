//! Statistics over utilization windows

use chrono::{Datelike, TimeZone, Timelike, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::models::{UtilizationSample, WorkloadSpec};

/// Nearest-rank percentile of unsorted values, `p` in 0..=100
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Standard deviation relative to the mean; zero for an all-zero series
pub fn coefficient_of_variation(values: &[f64]) -> f64 {
    let m = mean(values);
    if m <= f64::EPSILON {
        return 0.0;
    }
    std_dev(values) / m
}

/// Hour of the week of a unix timestamp, 0 = Monday 00:00 UTC
pub fn hour_of_week(timestamp: i64) -> u16 {
    match Utc.timestamp_opt(timestamp, 0).single() {
        Some(t) => (t.weekday().num_days_from_monday() * 24 + t.hour()) as u16,
        None => 0,
    }
}

/// Mean CPU usage per populated hour-of-week bucket
pub fn hour_of_week_buckets(samples: &[UtilizationSample]) -> BTreeMap<u16, f64> {
    let mut sums: BTreeMap<u16, (f64, usize)> = BTreeMap::new();
    for s in samples {
        let entry = sums.entry(hour_of_week(s.timestamp)).or_insert((0.0, 0));
        entry.0 += s.cpu_cores;
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(hour, (sum, n))| (hour, sum / n as f64))
        .collect()
}

/// Time covered by a sample series: first to last plus one typical interval
pub fn observed_span(samples: &[UtilizationSample]) -> Duration {
    if samples.len() < 2 {
        return Duration::ZERO;
    }
    let mut gaps: Vec<f64> = samples
        .windows(2)
        .map(|w| (w[1].timestamp - w[0].timestamp).max(0) as f64)
        .collect();
    gaps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median_gap = gaps[gaps.len() / 2];
    let first = samples[0].timestamp;
    let last = samples[samples.len() - 1].timestamp;
    Duration::from_secs(((last - first).max(0) as f64 + median_gap) as u64)
}

/// Summary of a utilization window relative to the workload's requests
#[derive(Debug, Clone, PartialEq)]
pub struct UtilizationSummary {
    pub sample_count: usize,
    pub span: Duration,
    /// Newest sample timestamp
    pub as_of: i64,
    pub cpu_p95_cores: f64,
    pub memory_p95_bytes: f64,
    /// Average usage divided by the per-replica request
    pub cpu_utilization_avg: f64,
    pub memory_utilization_avg: f64,
    pub cpu_utilization_p95: f64,
    pub memory_utilization_p95: f64,
    /// Mean of the CPU and memory coefficients of variation
    pub variance: f64,
}

impl UtilizationSummary {
    pub fn from_samples(workload: &WorkloadSpec, samples: &[UtilizationSample]) -> Self {
        let cpu: Vec<f64> = samples.iter().map(|s| s.cpu_cores).collect();
        let mem: Vec<f64> = samples.iter().map(|s| s.memory_bytes as f64).collect();

        let cpu_request_cores = workload.cpu_request_millicores() as f64 / 1000.0;
        let mem_request = workload.memory_request_bytes() as f64;
        let ratio = |usage: f64, request: f64| if request > 0.0 { usage / request } else { 0.0 };

        let cpu_p95 = percentile(&cpu, 95.0);
        let mem_p95 = percentile(&mem, 95.0);

        Self {
            sample_count: samples.len(),
            span: observed_span(samples),
            as_of: samples.last().map(|s| s.timestamp).unwrap_or(0),
            cpu_p95_cores: cpu_p95,
            memory_p95_bytes: mem_p95,
            cpu_utilization_avg: ratio(mean(&cpu), cpu_request_cores),
            memory_utilization_avg: ratio(mean(&mem), mem_request),
            cpu_utilization_p95: ratio(cpu_p95, cpu_request_cores),
            memory_utilization_p95: ratio(mem_p95, mem_request),
            variance: (coefficient_of_variation(&cpu) + coefficient_of_variation(&mem)) / 2.0,
        }
    }
}
