//! Order statistics over a trial set.
//!
//! Quartiles use the split-with-shared-midpoint rule: after sorting, p25 is
//! the median of `arr[..=mid]` for odd counts (`arr[..mid]` for even) and
//! p75 is the median of `arr[mid..]`, where `mid = len / 2`. This is not
//! linear interpolation and must not be replaced by it.

use std::str::FromStr;

use serde::Serialize;

use crate::error::{HarvestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DataPoint {
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Sample standard deviation; absent with fewer than two samples.
    pub stdev: Option<f64>,
    pub n: usize,
}

impl DataPoint {
    pub fn from_samples(samples: &[f64]) -> Result<Self> {
        Self::build(samples.to_vec())
    }

    /// Summarises `divisor / x` for every sample `x`, e.g. megabytes over
    /// elapsed seconds.
    pub fn normalized(samples: &[f64], divisor: f64) -> Result<Self> {
        let values = samples
            .iter()
            .map(|&x| {
                if x > 0.0 && x.is_finite() {
                    Ok(divisor / x)
                } else {
                    Err(HarvestError::InvalidSample(x))
                }
            })
            .collect::<Result<Vec<f64>>>()?;
        Self::build(values)
    }

    fn build(mut arr: Vec<f64>) -> Result<Self> {
        if arr.is_empty() {
            return Err(HarvestError::NoSamples("empty sample set".into()));
        }
        arr.sort_by(f64::total_cmp);

        let n = arr.len();
        let mid = n / 2;
        let p25 = if n % 2 == 1 {
            median(&arr[..=mid])
        } else {
            median(&arr[..mid])
        };
        let p75 = median(&arr[mid..]);
        let mean = arr.iter().sum::<f64>() / n as f64;
        let stdev = (n >= 2).then(|| {
            let ss: f64 = arr.iter().map(|x| (x - mean).powi(2)).sum();
            (ss / (n - 1) as f64).sqrt()
        });

        Ok(Self {
            p25,
            p50: median(&arr),
            p75,
            min: arr[0],
            max: arr[n - 1],
            mean,
            stdev,
            n,
        })
    }

    /// Central value with lower/upper error bars under `mode`.
    pub fn summary(&self, mode: Aggregation) -> Summary {
        match mode {
            Aggregation::Median => Summary {
                y: self.p50,
                err_lower: self.p50 - self.p25,
                err_upper: self.p75 - self.p50,
            },
            Aggregation::Mean => {
                let err = self.stdev.unwrap_or(0.0);
                Summary {
                    y: self.mean,
                    err_lower: err,
                    err_upper: err,
                }
            }
        }
    }
}

/// Median of already-sorted, non-empty values.
fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// How a condition's samples are reduced to one plotted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// p50 with the interquartile range as error bars.
    #[default]
    Median,
    /// Mean with the sample standard deviation as error bars.
    Mean,
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "median" => Ok(Aggregation::Median),
            "mean" => Ok(Aggregation::Mean),
            other => Err(format!("unknown aggregation: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub y: f64,
    pub err_lower: f64,
    pub err_upper: f64,
}

/// Goodput in Mbit/s of `megabytes` delivered in `seconds`.
pub fn throughput_mbps(megabytes: f64, seconds: f64) -> f64 {
    megabytes * 8.0 / seconds
}
