//! Condition sweeps and the per-condition series handed to plotting.

use serde::Serialize;

use crate::condition::{Axis, Condition, TrialMatrix};
use crate::error::Result;
use crate::reconcile::Target;
use crate::stats::{Aggregation, DataPoint, Summary};

/// Data sizes in kB: dense at small transfers, sparse at large ones.
pub fn data_size_xs(max_x: u64) -> Vec<u64> {
    (200..1000)
        .step_by(200)
        .chain((1000..10_000).step_by(1000))
        .chain((10_000..20_000).step_by(2000))
        .chain((20_000..100_000).step_by(5000))
        .chain([100_000])
        .filter(|&x| x <= max_x)
        .collect()
}

/// Loss rates in hundredths of a percent, 0 to 8% in steps of 0.5%.
pub fn loss_xs(max_x: u64) -> Vec<u64> {
    (0..=800).step_by(50).filter(|&x| x <= max_x).collect()
}

/// One target per x, all sharing `base` apart from the swept field.
pub fn targets(base: &Condition, axis: Axis, xs: &[u64], trials: usize) -> Vec<Target> {
    xs.iter()
        .map(|&x| Target {
            condition: at(base, axis, x),
            trials,
        })
        .collect()
}

/// `base` with the `axis` field set to `x`.
pub fn at(base: &Condition, axis: Axis, x: u64) -> Condition {
    let mut c = base.clone();
    match axis {
        Axis::Loss => c.loss = Some(x.min(u32::MAX as u64) as u32),
        Axis::DataSize => c.data_size_kb = Some(x),
    }
    c
}

/// How raw samples are turned into plotted values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Normalization {
    /// Samples are plotted as-is.
    Raw,
    /// Samples are elapsed seconds for a fixed payload; plot `divisor / x`.
    Fixed { divisor: f64 },
    /// Samples are elapsed seconds for the swept data size; plot MB/s.
    PerDataSize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub x: u64,
    pub summary: Summary,
    pub data: DataPoint,
}

/// One protocol's summarised sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub condition: Condition,
    pub axis: Axis,
    pub aggregation: Aggregation,
    pub normalization: Normalization,
    pub points: Vec<SeriesPoint>,
    /// xs with no samples at all, left out of `points`.
    pub empty: Vec<u64>,
}

impl Series {
    pub fn build(
        matrix: &TrialMatrix,
        base: &Condition,
        axis: Axis,
        xs: &[u64],
        aggregation: Aggregation,
        normalization: Normalization,
    ) -> Result<Self> {
        let mut points = Vec::new();
        let mut empty = Vec::new();
        for &x in xs {
            let samples = matrix.samples(&at(base, axis, x));
            if samples.is_empty() {
                empty.push(x);
                continue;
            }
            let data = match normalization {
                Normalization::Raw => DataPoint::from_samples(samples)?,
                Normalization::Fixed { divisor } => DataPoint::normalized(samples, divisor)?,
                Normalization::PerDataSize => DataPoint::normalized(samples, x as f64 / 1000.0)?,
            };
            points.push(SeriesPoint {
                x,
                summary: data.summary(aggregation),
                data,
            });
        }
        Ok(Self {
            condition: base.clone(),
            axis,
            aggregation,
            normalization,
            points,
            empty,
        })
    }
}

/// Everything computed for one figure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesDocument {
    pub title: String,
    pub series: Vec<Series>,
}

impl SeriesDocument {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_targets() {
        let xs = data_size_xs(u64::MAX);
        assert_eq!(&xs[..5], &[200, 400, 600, 800, 1000]);
        assert_eq!(xs.last(), Some(&100_000));
        assert!(xs.contains(&18_000));
        assert!(!xs.contains(&19_000));
        assert_eq!(data_size_xs(1000), vec![200, 400, 600, 800, 1000]);

        let xs = loss_xs(800);
        assert_eq!(xs.len(), 17);
        assert_eq!(loss_xs(100), vec![0, 50, 100]);
    }

    #[test]
    fn series_points_and_gaps() {
        let base = Condition::new("pep", "cubic");
        let mut m = TrialMatrix::new();
        m.extend(&at(&base, Axis::Loss, 0), &[1.0, 2.0, 4.0], None);
        let series = Series::build(
            &m,
            &base,
            Axis::Loss,
            &[0, 50],
            Aggregation::Median,
            Normalization::Fixed { divisor: 80.0 },
        )
        .unwrap();
        assert_eq!(series.points.len(), 1);
        assert_eq!(series.points[0].summary.y, 40.0);
        assert_eq!(series.empty, vec![50]);

        let doc = SeriesDocument {
            title: "loss".into(),
            series: vec![series],
        };
        let json = doc.to_json().unwrap();
        assert!(json.contains("\"aggregation\": \"median\""));
        assert!(json.contains("\"kind\": \"fixed\""));
    }

    #[test]
    fn per_data_size_normalization() {
        let base = Condition::new("quic", "cubic");
        let mut m = TrialMatrix::new();
        m.extend(&at(&base, Axis::DataSize, 2000), &[4.0], None);
        let series = Series::build(
            &m,
            &base,
            Axis::DataSize,
            &[2000],
            Aggregation::Mean,
            Normalization::PerDataSize,
        )
        .unwrap();
        assert_eq!(series.points[0].summary.y, 0.5);
    }
}
