//! Experiment configuration.
//!
//! [`ExperimentConfigInput`] is the loosely-typed form read from TOML and
//! merged with CLI flags. [`ExperimentConfigInput::resolve`] validates it
//! into an [`ExperimentConfig`]; nothing touches the network before that
//! succeeds.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::buffer::DEFAULT_MTU;
use crate::error::{Result, SimError};
use crate::shaper::{LinkSpec, QdiscStrategy};

/// Port the transparent proxy listens on inside the relay.
pub const PROXY_PORT: u16 = 5000;

/// TCP congestion control algorithms the hosts may be switched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionControl {
    Reno,
    #[default]
    Cubic,
}

impl CongestionControl {
    pub fn as_str(&self) -> &'static str {
        match self {
            CongestionControl::Reno => "reno",
            CongestionControl::Cubic => "cubic",
        }
    }
}

impl fmt::Display for CongestionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CongestionControl {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "reno" => Ok(CongestionControl::Reno),
            "cubic" => Ok(CongestionControl::Cubic),
            other => Err(SimError::config(format!(
                "unsupported congestion control algorithm: {other} (expected reno|cubic)"
            ))),
        }
    }
}

/// How often the sidekick observer emits a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Millis(u64),
    Packets(u64),
}

impl Cadence {
    /// Flags passed to the sidekick sender binary.
    pub fn sender_args(&self) -> [String; 2] {
        match self {
            Cadence::Millis(ms) => ["--frequency-ms".into(), ms.to_string()],
            Cadence::Packets(n) => ["--frequency-pkts".into(), n.to_string()],
        }
    }
}

impl FromStr for Cadence {
    type Err = SimError;

    /// `"<n>ms"` or `"<n>p"` (anything after the `p` is ignored).
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || SimError::config(format!("invalid sidekick frequency: {s}"));
        if let Some(ms) = s.strip_suffix("ms") {
            return ms.parse().map(Cadence::Millis).map_err(|_| invalid());
        }
        let digits: &str = &s[..s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len())];
        if !digits.is_empty() && s[digits.len()..].starts_with('p') {
            return digits.parse().map(Cadence::Packets).map_err(|_| invalid());
        }
        Err(invalid())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SidekickConfig {
    pub cadence: Cadence,
    /// Threshold number of missing packets before a digest is decodable.
    pub threshold: u32,
}

/// Auxiliary relay-side process. At most one may run at a time.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Auxiliary {
    #[default]
    None,
    Proxy,
    Sidekick(SidekickConfig),
}

/// External programs the supervisor launches. Each entry is an argv prefix.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Programs {
    pub webserver: Vec<String>,
    /// Line the webserver logs once it accepts connections.
    pub webserver_ready_marker: String,
    pub proxy: Vec<String>,
    pub sidekick_sender: Vec<String>,
    pub client: Vec<String>,
}

impl Default for Programs {
    fn default() -> Self {
        Self {
            webserver: vec!["python3".into(), "webserver/server.py".into()],
            webserver_ready_marker: "Starting httpd".into(),
            proxy: vec!["pepsal".into(), "-v".into()],
            sidekick_sender: vec!["./target/release/sender".into()],
            client: vec!["python3".into(), "mininet/client.py".into()],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LinkInput {
    pub delay_ms: Option<f64>,
    pub loss_percent: Option<f64>,
    pub bandwidth_mbps: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SidekickInput {
    pub frequency: Option<String>,
    pub threshold: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExperimentConfigInput {
    /// Server ↔ relay segment.
    pub link1: LinkInput,
    /// Relay ↔ client segment.
    pub link2: LinkInput,
    pub qdisc: Option<String>,
    pub cc: Option<String>,
    pub offload: Option<bool>,
    pub mtu: Option<u32>,
    pub proxy: bool,
    pub sidekick: Option<SidekickInput>,
    pub programs: Option<Programs>,
    pub workdir: Option<PathBuf>,
    pub sudo: Option<bool>,
}

/// Validated configuration for one experiment run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    pub link1: LinkSpec,
    pub link2: LinkSpec,
    pub cc: CongestionControl,
    /// TSO/GSO enabled on every interface.
    pub offload: bool,
    pub mtu: u32,
    pub aux: Auxiliary,
    pub programs: Programs,
    pub workdir: PathBuf,
    pub sudo: bool,
}

/// Server ↔ relay defaults: delay ms, loss %, bandwidth Mbps.
const LINK1_DEFAULTS: (f64, f64, f64) = (25.0, 0.0, 10.0);
/// Relay ↔ client defaults: delay ms, loss %, bandwidth Mbps.
const LINK2_DEFAULTS: (f64, f64, f64) = (1.0, 1.0, 100.0);

impl Default for ExperimentConfig {
    fn default() -> Self {
        let qdisc = QdiscStrategy::default();
        Self {
            link1: resolve_link(&LinkInput::default(), qdisc, LINK1_DEFAULTS),
            link2: resolve_link(&LinkInput::default(), qdisc, LINK2_DEFAULTS),
            cc: CongestionControl::default(),
            offload: false,
            mtu: DEFAULT_MTU,
            aux: Auxiliary::None,
            programs: Programs::default(),
            workdir: PathBuf::from("."),
            sudo: true,
        }
    }
}

impl ExperimentConfigInput {
    pub fn resolve(self) -> Result<ExperimentConfig> {
        let qdisc = match self.qdisc.as_deref() {
            Some(name) => name.parse()?,
            None => QdiscStrategy::default(),
        };
        let cc = match self.cc.as_deref() {
            Some(name) => name.parse()?,
            None => CongestionControl::default(),
        };

        let link1 = resolve_link(&self.link1, qdisc, LINK1_DEFAULTS);
        let link2 = resolve_link(&self.link2, qdisc, LINK2_DEFAULTS);
        link1.validate()?;
        link2.validate()?;

        let aux = match (self.proxy, self.sidekick) {
            (true, Some(_)) => {
                return Err(SimError::config(
                    "the transparent proxy and the sidekick observer cannot run together",
                ));
            }
            (true, None) => Auxiliary::Proxy,
            (false, Some(sk)) => Auxiliary::Sidekick(SidekickConfig {
                cadence: sk.frequency.as_deref().unwrap_or("2ms").parse()?,
                threshold: sk.threshold.unwrap_or(20),
            }),
            (false, None) => Auxiliary::None,
        };

        let mtu = self.mtu.unwrap_or(DEFAULT_MTU);
        if mtu == 0 {
            return Err(SimError::config("MTU must be non-zero"));
        }

        Ok(ExperimentConfig {
            link1,
            link2,
            cc,
            offload: self.offload.unwrap_or(false),
            mtu,
            aux,
            programs: self.programs.unwrap_or_default(),
            workdir: self.workdir.unwrap_or_else(|| PathBuf::from(".")),
            sudo: self.sudo.unwrap_or(true),
        })
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        toml::from_str(input).map_err(|e| SimError::config(format!("invalid config TOML: {e}")))
    }
}

fn resolve_link(
    input: &LinkInput,
    qdisc: QdiscStrategy,
    (delay_ms, loss_percent, bandwidth_mbps): (f64, f64, f64),
) -> LinkSpec {
    LinkSpec {
        bandwidth_mbps: input.bandwidth_mbps.unwrap_or(bandwidth_mbps),
        delay_ms: input.delay_ms.unwrap_or(delay_ms),
        loss_percent: input.loss_percent.unwrap_or(loss_percent),
        qdisc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let cfg = ExperimentConfig::default();
        assert_eq!(cfg.link1.delay_ms, 25.0);
        assert_eq!(cfg.link2.bandwidth_mbps, 100.0);
        assert_eq!(cfg.cc, CongestionControl::Cubic);
        assert_eq!(cfg.aux, Auxiliary::None);
        assert!(!cfg.offload);
        assert_eq!(cfg.mtu, 1500);
        assert!(cfg.link1.validate().is_ok() && cfg.link2.validate().is_ok());
        // Resolving an empty input yields the same configuration.
        assert_eq!(cfg, ExperimentConfigInput::default().resolve().unwrap());
    }

    #[test]
    fn parse_toml_config() {
        let input = ExperimentConfigInput::from_toml_str(
            r#"
            qdisc = "codel"
            cc = "reno"

            [link1]
            delay_ms = 75
            bandwidth_mbps = 20

            [link2]
            loss_percent = 2.5

            [sidekick]
            frequency = "30ms"
            threshold = 10

            [programs]
            client = ["./client", "--quiet"]
            "#,
        )
        .unwrap();
        let cfg = input.resolve().unwrap();
        assert_eq!(cfg.link1.qdisc, QdiscStrategy::Codel);
        assert_eq!(cfg.link1.delay_ms, 75.0);
        assert_eq!(cfg.link1.bandwidth_mbps, 20.0);
        assert_eq!(cfg.link2.loss_percent, 2.5);
        assert_eq!(cfg.cc, CongestionControl::Reno);
        assert_eq!(
            cfg.aux,
            Auxiliary::Sidekick(SidekickConfig {
                cadence: Cadence::Millis(30),
                threshold: 10
            })
        );
        assert_eq!(cfg.programs.client, vec!["./client", "--quiet"]);
        assert_eq!(cfg.programs.webserver_ready_marker, "Starting httpd");
    }

    #[test]
    fn rejects_unknown_cc() {
        let input = ExperimentConfigInput {
            cc: Some("bbr".into()),
            ..Default::default()
        };
        assert!(matches!(input.resolve(), Err(SimError::Config(_))));
    }

    #[test]
    fn rejects_proxy_with_sidekick() {
        let input = ExperimentConfigInput {
            proxy: true,
            sidekick: Some(SidekickInput::default()),
            ..Default::default()
        };
        assert!(matches!(input.resolve(), Err(SimError::Config(_))));
    }

    #[test]
    fn cadence_forms() {
        assert_eq!("2ms".parse::<Cadence>().unwrap(), Cadence::Millis(2));
        assert_eq!("16p".parse::<Cadence>().unwrap(), Cadence::Packets(16));
        assert_eq!("4pkts".parse::<Cadence>().unwrap(), Cadence::Packets(4));
        assert!("fast".parse::<Cadence>().is_err());
        assert!("ms".parse::<Cadence>().is_err());
        assert_eq!(
            Cadence::Packets(8).sender_args(),
            ["--frequency-pkts".to_string(), "8".to_string()]
        );
    }
}
