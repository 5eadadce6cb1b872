//! Traffic shaping: qdisc strategy → ordered `tc` command plan.
//!
//! Every strategy is a netem loss/delay stage installed at the root of the
//! interface, followed by rate limiting / queueing stages that attach as its
//! children. The children reference handles created by the root, so the
//! plan must be applied in order.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::buffer::QueueCapacity;
use crate::error::{Result, SimError};
use crate::exec::HostCommand;

/// Queueing discipline composition applied to one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum QdiscStrategy {
    /// netem + token bucket filter sized to the BDP.
    #[default]
    Tbf,
    /// netem + CAKE shaper.
    Cake,
    /// rate-limiting netem + CoDel AQM.
    Codel,
    /// rate-limiting netem + adaptive RED sized to 4× the BDP.
    Red,
    /// netem → htb class → RED.
    Hierarchical,
    /// No shaping at all.
    None,
}

impl QdiscStrategy {
    pub const ALL: [QdiscStrategy; 6] = [
        QdiscStrategy::Tbf,
        QdiscStrategy::Cake,
        QdiscStrategy::Codel,
        QdiscStrategy::Red,
        QdiscStrategy::Hierarchical,
        QdiscStrategy::None,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QdiscStrategy::Tbf => "tbf",
            QdiscStrategy::Cake => "cake",
            QdiscStrategy::Codel => "codel",
            QdiscStrategy::Red => "red",
            QdiscStrategy::Hierarchical => "hierarchical",
            QdiscStrategy::None => "none",
        }
    }
}

impl fmt::Display for QdiscStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QdiscStrategy {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tbf" => Ok(QdiscStrategy::Tbf),
            "cake" => Ok(QdiscStrategy::Cake),
            "codel" => Ok(QdiscStrategy::Codel),
            "red" => Ok(QdiscStrategy::Red),
            "hierarchical" | "grenville" => Ok(QdiscStrategy::Hierarchical),
            "none" => Ok(QdiscStrategy::None),
            other => Err(SimError::config(format!("unknown qdisc strategy: {other}"))),
        }
    }
}

impl TryFrom<String> for QdiscStrategy {
    type Error = SimError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Loss, delay and rate of one path segment. Fixed once the topology is built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkSpec {
    pub bandwidth_mbps: f64,
    pub delay_ms: f64,
    pub loss_percent: f64,
    pub qdisc: QdiscStrategy,
}

impl LinkSpec {
    pub fn validate(&self) -> Result<()> {
        if !self.bandwidth_mbps.is_finite() || self.bandwidth_mbps <= 0.0 {
            return Err(SimError::config(format!(
                "link bandwidth must be positive, got {} Mbps",
                self.bandwidth_mbps
            )));
        }
        if !self.delay_ms.is_finite() || self.delay_ms < 0.0 {
            return Err(SimError::config(format!(
                "link delay must be non-negative, got {} ms",
                self.delay_ms
            )));
        }
        if !(0.0..=100.0).contains(&self.loss_percent) {
            return Err(SimError::config(format!(
                "link loss must be within 0..=100%, got {}",
                self.loss_percent
            )));
        }
        Ok(())
    }
}

/// Which half of a strategy a command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// netem loss/delay (and, for some strategies, rate).
    Impairment,
    /// Rate limiting and queue management attached below the impairment.
    Queue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapingStep {
    pub stage: Stage,
    pub command: HostCommand,
}

/// Ordered shaping plan for `iface` on `host`.
///
/// Returns an empty plan for [`QdiscStrategy::None`].
pub fn shaping_plan(
    host: &str,
    iface: &str,
    link: &LinkSpec,
    capacity: &QueueCapacity,
) -> Vec<ShapingStep> {
    let bw = link.bandwidth_mbps;
    let netem = format!("netem loss {}% delay {}ms", link.loss_percent, link.delay_ms);
    let limit = capacity.limit_bytes();

    let lines: Vec<(Stage, String)> = match link.qdisc {
        QdiscStrategy::Tbf => vec![
            (
                Stage::Impairment,
                format!("tc qdisc add dev {iface} root handle 1:0 {netem}"),
            ),
            (
                Stage::Queue,
                format!(
                    "tc qdisc add dev {iface} parent 1:1 handle 10: tbf rate {bw}mbit burst {} limit {limit}",
                    tbf_burst_bytes(bw)
                ),
            ),
        ],
        QdiscStrategy::Cake => vec![
            (
                Stage::Impairment,
                format!("tc qdisc add dev {iface} root handle 1:0 {netem}"),
            ),
            (
                Stage::Queue,
                format!(
                    "tc qdisc add dev {iface} parent 1:1 handle 10: cake bandwidth {bw}mbit oceanic flowblind besteffort"
                ),
            ),
        ],
        QdiscStrategy::Codel => vec![
            (
                Stage::Impairment,
                format!("tc qdisc add dev {iface} root handle 1:0 {netem} rate {bw}mbit"),
            ),
            (
                Stage::Queue,
                format!("tc qdisc add dev {iface} parent 1:1 handle 10: codel"),
            ),
        ],
        QdiscStrategy::Red => vec![
            (
                Stage::Impairment,
                format!("tc qdisc add dev {iface} root handle 1:0 {netem} rate {bw}mbit"),
            ),
            (
                Stage::Queue,
                format!(
                    "tc qdisc add dev {iface} parent 1:1 handle 10: red limit {} avpkt 1000 adaptive harddrop bandwidth {bw}Mbit",
                    limit * 4
                ),
            ),
        ],
        QdiscStrategy::Hierarchical => vec![
            (
                Stage::Impairment,
                format!("tc qdisc add dev {iface} root handle 2: {netem}"),
            ),
            (
                Stage::Queue,
                format!("tc qdisc add dev {iface} parent 2: handle 3: htb default 10"),
            ),
            (
                Stage::Queue,
                format!("tc class add dev {iface} parent 3: classid 3:10 htb rate {bw}Mbit"),
            ),
            (
                Stage::Queue,
                format!(
                    "tc qdisc add dev {iface} parent 3:10 handle 11: red limit {} avpkt 1000 adaptive harddrop bandwidth {bw}Mbit",
                    limit * 4
                ),
            ),
        ],
        QdiscStrategy::None => {
            tracing::info!(host, iface, "no qdisc enabled");
            Vec::new()
        }
    };

    lines
        .into_iter()
        .map(|(stage, line)| ShapingStep {
            stage,
            command: HostCommand::parse(Some(host), &line),
        })
        .collect()
}

/// Removes whatever root qdisc is installed on `iface`.
pub fn clear_command(host: &str, iface: &str) -> HostCommand {
    HostCommand::on(host, "tc").args(["qdisc", "del", "dev", iface, "root"])
}

/// tbf bucket: 1000 bytes per Mbps of rate.
fn tbf_burst_bytes(bw_mbps: f64) -> u64 {
    (bw_mbps * 500.0 * 2.0).ceil() as u64
}
