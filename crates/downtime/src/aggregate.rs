//! Hourly latency aggregation over result records.
//!
//! This module produces what the dashboard reads:
//! - A fixed-size series of the last N hours, oldest first
//! - Per bucket: request count, error count, avg/min/max/p95/p99 latency
//! - An endpoint status derived from the error rate and the SLO target
//!
//! Latency statistics only use records that obtained a response; failed
//! attempts count towards the error rate instead.
//!
//! Neither binary calls into this module. It is a library helper for
//! whatever reads the result log back, and its output shape is the contract
//! the dashboard expects.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;

use crate::model::ResultRecord;

/// Hours shown by default
pub const DEFAULT_HOURS: usize = 6;

/// One hourly bucket
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyPoint {
    pub bucket_start: DateTime<Utc>,
    pub count: usize,
    pub errors: usize,
    pub avg_ms: Option<f64>,
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Operational,
    Warning,
    Critical,
}

/// Thresholds for deriving [`EndpointStatus`]
#[derive(Debug, Clone)]
pub struct StatusPolicy {
    /// Error rate at or above which the endpoint is in warning
    pub warning_error_rate: f64,
    /// Error rate at or above which the endpoint is critical
    pub critical_error_rate: f64,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self { warning_error_rate: 0.05, critical_error_rate: 0.25 }
    }
}

impl StatusPolicy {
    /// No data reads as warning: a silent endpoint is not known to be up.
    pub fn evaluate(&self, records: &[&ResultRecord], slo_ms: Option<u64>) -> EndpointStatus {
        if records.is_empty() {
            return EndpointStatus::Warning;
        }

        let errors = records.iter().filter(|record| !record.ok).count();
        let error_rate = errors as f64 / records.len() as f64;
        if error_rate >= self.critical_error_rate {
            return EndpointStatus::Critical;
        }
        if error_rate >= self.warning_error_rate {
            return EndpointStatus::Warning;
        }

        let mut latencies = response_latencies(records.iter().copied());
        latencies.sort_unstable();
        match (slo_ms, percentile(&latencies, 95.0)) {
            (Some(slo), Some(p95)) if p95 > slo => EndpointStatus::Warning,
            _ => EndpointStatus::Operational,
        }
    }
}

/// Series plus status for one endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointSummary {
    pub endpoint_id: String,
    pub slo_ms: Option<u64>,
    pub status: EndpointStatus,
    pub series: Vec<LatencyPoint>,
}

/// Nearest-rank percentile of ascending `sorted`
pub fn percentile(sorted: &[u64], p: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

fn response_latencies<'a>(records: impl Iterator<Item = &'a ResultRecord>) -> Vec<u64> {
    records.filter(|record| record.error_kind.is_none()).map(|record| record.latency_ms).collect()
}

fn window_start(now: DateTime<Utc>, hours: usize) -> DateTime<Utc> {
    let current = now.duration_trunc(Duration::hours(1)).unwrap_or(now);
    current - Duration::hours(hours.saturating_sub(1) as i64)
}

fn in_window<'a>(
    records: &'a [ResultRecord],
    start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> impl Iterator<Item = &'a ResultRecord> {
    records.iter().filter(move |record| {
        record.event_time().is_some_and(|time| time >= start && time <= now)
    })
}

/// Bucket records into the `hours` hourly buckets ending with the current
/// hour. Empty hours are kept so the series always has `hours` points.
pub fn hourly_series(records: &[ResultRecord], now: DateTime<Utc>, hours: usize) -> Vec<LatencyPoint> {
    if hours == 0 {
        return Vec::new();
    }
    let start = window_start(now, hours);
    let mut buckets: Vec<Vec<&ResultRecord>> = vec![Vec::new(); hours];

    for record in in_window(records, start, now) {
        let Some(time) = record.event_time() else { continue };
        let index = ((time - start).num_hours().max(0) as usize).min(hours.saturating_sub(1));
        buckets[index].push(record);
    }

    buckets
        .into_iter()
        .enumerate()
        .map(|(index, bucket)| {
            let mut latencies = response_latencies(bucket.iter().copied());
            latencies.sort_unstable();
            let total: u64 = latencies.iter().sum();

            LatencyPoint {
                bucket_start: start + Duration::hours(index as i64),
                count: bucket.len(),
                errors: bucket.iter().filter(|record| !record.ok).count(),
                avg_ms: (!latencies.is_empty()).then(|| total as f64 / latencies.len() as f64),
                min_ms: latencies.first().copied(),
                max_ms: latencies.last().copied(),
                p95_ms: percentile(&latencies, 95.0),
                p99_ms: percentile(&latencies, 99.0),
            }
        })
        .collect()
}

/// Series and status for one endpoint out of a mixed record set
pub fn summarize(
    endpoint_id: &str,
    records: &[ResultRecord],
    now: DateTime<Utc>,
    hours: usize,
    slo_ms: Option<u64>,
    policy: &StatusPolicy,
) -> EndpointSummary {
    let own: Vec<ResultRecord> =
        records.iter().filter(|record| record.endpoint_id == endpoint_id).cloned().collect();
    let windowed: Vec<&ResultRecord> = if hours == 0 {
        Vec::new()
    } else {
        in_window(&own, window_start(now, hours), now).collect()
    };

    EndpointSummary {
        endpoint_id: endpoint_id.to_string(),
        slo_ms,
        status: policy.evaluate(&windowed, slo_ms),
        series: hourly_series(&own, now, hours),
    }
}
