//! Congestion window time series.
//!
//! QUIC clients log their window as condition-window-sample lines; TCP
//! windows come from periodic `ss -i` samples or iperf interval reports.
//! All series are expressed in kB against seconds since the first sample.

use serde::Serialize;

use crate::grammar::{parse_iperf_cwnd, parse_ss_cwnd, parse_window_line};

/// kB per MTU-sized packet.
pub const KB_PER_PACKET: f64 = 1.5;

/// Seconds skipped before averaging the steady-state window.
pub const WARMUP_SECS: usize = 5;

/// Default `ss` sampling interval.
pub const SS_INTERVAL_SECS: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSample {
    /// Seconds since the first sample.
    pub t: f64,
    /// Window in kB.
    pub kb: f64,
    /// Why the window was logged; empty for sampled sources.
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowSeries {
    pub samples: Vec<WindowSample>,
}

/// A window reduction and the events on either side of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decrease {
    /// When the smaller window was logged.
    pub t: f64,
    pub before_reason: String,
    pub after_reason: String,
}

impl WindowSeries {
    /// Samples of `metric` from condition-window-sample lines; other lines
    /// are ignored.
    pub fn from_instant_log(text: &str, metric: &str) -> Self {
        let raw: Vec<_> = text
            .lines()
            .filter_map(parse_window_line)
            .filter(|w| w.metric == metric)
            .collect();
        let t0 = raw
            .iter()
            .map(|w| w.timestamp)
            .fold(f64::INFINITY, f64::min);
        Self {
            samples: raw
                .into_iter()
                .map(|w| WindowSample {
                    t: w.timestamp - t0,
                    kb: w.value as f64 / 1000.0,
                    reason: w.reason,
                })
                .collect(),
        }
    }

    /// `cwnd:<segments>` samples taken every `interval` seconds.
    pub fn from_ss_log(text: &str, interval: f64) -> Self {
        let samples = text
            .lines()
            .filter_map(parse_ss_cwnd)
            .enumerate()
            .map(|(i, segments)| WindowSample {
                t: interval * i as f64,
                kb: segments as f64 * KB_PER_PACKET,
                reason: String::new(),
            })
            .collect();
        Self { samples }
    }

    /// iperf interval reports with a trailing `KBytes` window column.
    pub fn from_iperf_log(text: &str) -> Self {
        let samples = text
            .lines()
            .filter_map(parse_iperf_cwnd)
            .map(|(t, kb)| WindowSample {
                t,
                kb,
                reason: String::new(),
            })
            .collect();
        Self { samples }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// `(t, packets)` pairs.
    pub fn packets(&self) -> Vec<(f64, f64)> {
        self.samples
            .iter()
            .map(|s| (s.t, s.kb / KB_PER_PACKET))
            .collect()
    }

    pub fn decreases(&self) -> Vec<Decrease> {
        self.samples
            .windows(2)
            .filter(|w| w[0].kb > w[1].kb)
            .map(|w| Decrease {
                t: w[1].t,
                before_reason: w[0].reason.clone(),
                after_reason: w[1].reason.clone(),
            })
            .collect()
    }

    /// Number of samples logged for `reason` within `[from, to)` seconds.
    pub fn count_reason(&self, reason: &str, from: f64, to: f64) -> usize {
        self.samples
            .iter()
            .filter(|s| s.t >= from && s.t < to && s.reason == reason)
            .count()
    }
}

/// Mean of each whole second's values. A second without samples repeats
/// the previous average (zero if it is the first).
pub fn per_second_average(points: &[(f64, f64)]) -> Vec<f64> {
    let Some(last) = points.iter().map(|(t, _)| *t).reduce(f64::max) else {
        return Vec::new();
    };
    let mut buckets: Vec<Vec<f64>> = vec![Vec::new(); last.max(0.0) as usize + 1];
    for &(t, y) in points {
        buckets[t.max(0.0) as usize].push(y);
    }
    let mut avgs: Vec<f64> = Vec::with_capacity(buckets.len());
    for bucket in buckets {
        let avg = if bucket.is_empty() {
            avgs.last().copied().unwrap_or(0.0)
        } else {
            bucket.iter().sum::<f64>() / bucket.len() as f64
        };
        avgs.push(avg);
    }
    avgs
}

/// Average of the per-second values after the warm-up; zero if the series
/// is not longer than the warm-up.
pub fn steady_state_mean(per_second: &[f64]) -> f64 {
    if per_second.len() <= WARMUP_SECS {
        return 0.0;
    }
    let rest = &per_second[WARMUP_SECS..];
    rest.iter().sum::<f64>() / rest.len() as f64
}
