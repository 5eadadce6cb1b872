//! Experimental conditions and the trial matrix indexed by them.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// One experimental configuration.
///
/// `loss` is in hundredths of a percent. Fields a log does not vary are
/// fixed by the caller; the varying one is set by marker lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Condition {
    pub protocol: String,
    pub cc: String,
    pub loss: Option<u32>,
    pub data_size_kb: Option<u64>,
}

impl Condition {
    pub fn new(protocol: &str, cc: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            cc: cc.to_string(),
            loss: None,
            data_size_kb: None,
        }
    }

    pub fn with_loss(mut self, loss: u32) -> Self {
        self.loss = Some(loss);
        self
    }

    pub fn with_data_size(mut self, kb: u64) -> Self {
        self.data_size_kb = Some(kb);
        self
    }

    /// Coordinate of this condition along `axis`.
    pub fn x(&self, axis: Axis) -> Option<u64> {
        match axis {
            Axis::Loss => self.loss.map(u64::from),
            Axis::DataSize => self.data_size_kb,
        }
    }

    /// Loss as a percentage string with two decimals, e.g. `0.25`.
    pub fn loss_percent(&self) -> Option<String> {
        self.loss.map(format_loss)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.cc)?;
        if let Some(loss) = self.loss {
            write!(f, " loss={}%", format_loss(loss))?;
        }
        if let Some(kb) = self.data_size_kb {
            write!(f, " n={kb}k")?;
        }
        Ok(())
    }
}

/// `125` → `"1.25"`.
pub fn format_loss(hundredths: u32) -> String {
    format!("{}.{:02}", hundredths / 100, hundredths % 100)
}

/// The condition dimension a sweep varies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    Loss,
    DataSize,
}

/// Condition → raw samples in log order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialMatrix {
    entries: BTreeMap<Condition, Vec<f64>>,
}

impl TrialMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends samples, keeping at most `cap` per condition.
    pub fn extend(&mut self, condition: &Condition, samples: &[f64], cap: Option<usize>) {
        if samples.is_empty() {
            return;
        }
        let entry = self.entries.entry(condition.clone()).or_default();
        entry.extend_from_slice(samples);
        if let Some(cap) = cap {
            entry.truncate(cap);
        }
    }

    pub fn samples(&self, condition: &Condition) -> &[f64] {
        self.entries.get(condition).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn count(&self, condition: &Condition) -> usize {
        self.samples(condition).len()
    }

    pub fn conditions(&self) -> impl Iterator<Item = &Condition> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Condition, &[f64])> {
        self.entries.iter().map(|(c, s)| (c, s.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_respects_cap_and_order() {
        let cond = Condition::new("quic", "cubic").with_loss(100);
        let mut m = TrialMatrix::new();
        m.extend(&cond, &[3.0, 1.0], Some(3));
        m.extend(&cond, &[2.0, 9.0], Some(3));
        assert_eq!(m.samples(&cond), &[3.0, 1.0, 2.0]);
        m.extend(&cond, &[], None);
        assert_eq!(m.len(), 1);
        assert_eq!(m.count(&Condition::new("tcp", "cubic")), 0);
    }

    #[test]
    fn display_and_axes() {
        let cond = Condition::new("pep", "reno").with_loss(25).with_data_size(1000);
        assert_eq!(cond.to_string(), "pep/reno loss=0.25% n=1000k");
        assert_eq!(cond.x(Axis::Loss), Some(25));
        assert_eq!(cond.x(Axis::DataSize), Some(1000));
        assert_eq!(format_loss(800), "8.00");
    }
}
