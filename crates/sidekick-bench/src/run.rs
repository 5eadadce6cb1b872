//! `run`: one experiment on a freshly built network.
//!
//! Everything written to stdout here is benchmark log: the link and data
//! size markers followed by the client output of every trial.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, ValueEnum};

use sidekick_harvest::window::SS_INTERVAL_SECS;

use sidekick_sim::config::{ExperimentConfig, ExperimentConfigInput};
use sidekick_sim::counters::render_hop_table;
use sidekick_sim::exec::{CommandRunner, NetnsRunner};
use sidekick_sim::experiment::{data_size_marker, Experiment};
use sidekick_sim::monitor::WindowMonitor;
use sidekick_sim::protocol::{self, Protocol};
use sidekick_sim::topology::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MonitorKind {
    /// Poll `ss -t -i` during a bulk TCP transfer.
    Ss,
    /// iperf3 client interval reports.
    Iperf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MonitorHost {
    Relay,
    Client,
}

impl From<MonitorHost> for Host {
    fn from(host: MonitorHost) -> Self {
        match host {
            MonitorHost::Relay => Host::Relay,
            MonitorHost::Client => Host::Client,
        }
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Protocol of the first (or only) flow: tcp, pep, quic, quack.
    pub protocol: Protocol,

    /// TOML experiment config; flags below override it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Server ↔ relay delay in ms.
    #[arg(long)]
    pub delay1: Option<f64>,
    /// Relay ↔ client delay in ms.
    #[arg(long)]
    pub delay2: Option<f64>,
    /// Server ↔ relay loss in percent.
    #[arg(long)]
    pub loss1: Option<f64>,
    /// Relay ↔ client loss in percent.
    #[arg(long)]
    pub loss2: Option<f64>,
    /// Server ↔ relay bandwidth in Mbps.
    #[arg(long)]
    pub bw1: Option<f64>,
    /// Relay ↔ client bandwidth in Mbps.
    #[arg(long)]
    pub bw2: Option<f64>,

    /// tbf, cake, codel, red, hierarchical or none.
    #[arg(long)]
    pub qdisc: Option<String>,
    /// TCP congestion control: reno or cubic.
    #[arg(long)]
    pub cc: Option<String>,
    /// Leave TSO/GSO enabled.
    #[arg(long, default_value_t = false)]
    pub tso: bool,
    #[arg(long)]
    pub mtu: Option<u32>,

    /// Sidekick digest cadence, `<n>ms` or `<n>p`.
    #[arg(long)]
    pub frequency: Option<String>,
    /// Sidekick decoding threshold in packets.
    #[arg(long)]
    pub threshold: Option<u32>,

    /// Data transferred per trial, e.g. 10M or 500k.
    #[arg(short = 'n', long, default_value = "10M")]
    pub data_size: String,
    /// Sequential trials.
    #[arg(short = 't', long, default_value_t = 1)]
    pub trials: u32,
    /// Per-trial timeout in seconds.
    #[arg(long, default_value_t = 120)]
    pub timeout: u64,

    /// Protocol of a second, concurrent flow.
    #[arg(long)]
    pub second: Option<Protocol>,
    /// Seconds between the start of the first and second flow.
    #[arg(long, default_value_t = 0.0)]
    pub offset: f64,

    /// Record the TCP congestion window to `cwnd.log` in the workdir instead
    /// of running trials.
    #[arg(long, value_enum, conflicts_with = "second")]
    pub monitor: Option<MonitorKind>,
    /// Host the window is observed on.
    #[arg(long, value_enum, default_value_t = MonitorHost::Client)]
    pub monitor_host: MonitorHost,
    /// Seconds of window monitoring.
    #[arg(long, default_value_t = 10)]
    pub duration: u64,
    /// Seconds between `ss` samples.
    #[arg(long, default_value_t = SS_INTERVAL_SECS)]
    pub interval: f64,

    /// Directory for host logs, flow logs and the run lock.
    #[arg(long)]
    pub workdir: Option<PathBuf>,
    /// Run host commands directly instead of through sudo.
    #[arg(long, default_value_t = false)]
    pub no_sudo: bool,
}

/// Merges the config file, flags and the protocols' relay requirements.
pub fn build_config(args: &RunArgs) -> anyhow::Result<ExperimentConfig> {
    let mut input = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            ExperimentConfigInput::from_toml_str(&text)?
        }
        None => ExperimentConfigInput::default(),
    };

    let overrides = [
        (&mut input.link1.delay_ms, args.delay1),
        (&mut input.link2.delay_ms, args.delay2),
        (&mut input.link1.loss_percent, args.loss1),
        (&mut input.link2.loss_percent, args.loss2),
        (&mut input.link1.bandwidth_mbps, args.bw1),
        (&mut input.link2.bandwidth_mbps, args.bw2),
    ];
    for (field, value) in overrides {
        if value.is_some() {
            *field = value;
        }
    }
    if args.qdisc.is_some() {
        input.qdisc = args.qdisc.clone();
    }
    if args.cc.is_some() {
        input.cc = args.cc.clone();
    }
    if args.mtu.is_some() {
        input.mtu = args.mtu;
    }
    if args.tso {
        input.offload = Some(true);
    }
    if args.no_sudo {
        input.sudo = Some(false);
    }
    if args.workdir.is_some() {
        input.workdir = args.workdir.clone();
    }

    let (proxy, sidekick) = match args.second {
        Some(second) => {
            protocol::check_pairing(args.protocol, second)?;
            protocol::pairing_auxiliary(args.protocol, second)
        }
        None => (args.protocol.needs_proxy(), args.protocol.needs_sidekick()),
    };
    input.proxy |= proxy;
    if sidekick {
        let sk = input.sidekick.get_or_insert_with(Default::default);
        if args.frequency.is_some() {
            sk.frequency = args.frequency.clone();
        }
        if args.threshold.is_some() {
            sk.threshold = args.threshold;
        }
    }

    Ok(input.resolve()?)
}

/// The monitor selected by the flags, if any.
pub fn window_monitor(args: &RunArgs) -> anyhow::Result<Option<WindowMonitor>> {
    let Some(kind) = args.monitor else {
        return Ok(None);
    };
    Ok(Some(match kind {
        MonitorKind::Ss => {
            if !(args.interval.is_finite() && args.interval > 0.0) {
                bail!("--interval must be a positive number of seconds");
            }
            WindowMonitor::Ss {
                interval: Duration::from_secs_f64(args.interval),
            }
        }
        MonitorKind::Iperf => WindowMonitor::Iperf,
    }))
}

pub fn run(args: RunArgs) -> anyhow::Result<()> {
    if !(args.offset.is_finite() && args.offset >= 0.0) {
        bail!("--offset must be a non-negative number of seconds");
    }
    let monitor = window_monitor(&args)?;
    let config = build_config(&args)?;
    let data_marker = data_size_marker(&args.data_size)?;
    let timeout = Duration::from_secs(args.timeout);

    tracing::info!(
        protocol = %args.protocol,
        second = ?args.second,
        trials = args.trials,
        data_size = %args.data_size,
        "starting experiment"
    );

    let runner: Arc<dyn CommandRunner> = Arc::new(NetnsRunner::new(config.sudo));
    let launcher = NetnsRunner::new(config.sudo);
    let mut experiment =
        Experiment::setup(config, runner, launcher).context("setting up the emulated network")?;

    {
        let mut out = std::io::stdout().lock();
        for marker in experiment.link_markers() {
            writeln!(out, "{marker}")?;
        }
        writeln!(out, "{data_marker}")?;
        out.flush()?;
    }

    if let Some(monitor) = monitor {
        let host = Host::from(args.monitor_host);
        let result =
            experiment.monitor_window(monitor, host, Duration::from_secs(args.duration), timeout);
        let shutdown = experiment.shutdown();
        let output = result?;
        shutdown.context("tearing down the emulated network")?;
        tracing::info!(monitor = monitor.name(), samples = output.lines.len(), "window recorded");
        return Ok(());
    }

    let result = match args.second {
        None => experiment.run_trials(args.protocol, &args.data_size, args.trials, timeout),
        Some(second) => experiment.run_multiflow(
            args.protocol,
            second,
            &args.data_size,
            Duration::from_secs_f64(args.offset),
            timeout,
        ),
    };
    // Teardown happens whether or not the trials succeeded.
    let shutdown = experiment.shutdown();
    let report = result?;
    shutdown.context("tearing down the emulated network")?;

    for line in render_hop_table(&report.deltas) {
        tracing::info!("{line}");
    }
    let failed = report.trials.iter().filter(|t| !t.success()).count();
    if failed > 0 {
        tracing::warn!(failed, total = report.trials.len(), "some trial clients exited non-zero");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use sidekick_sim::config::{Auxiliary, Cadence};

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: RunArgs,
    }

    fn args(argv: &[&str]) -> RunArgs {
        let mut full = vec!["run"];
        full.extend_from_slice(argv);
        Wrapper::try_parse_from(full).unwrap().args
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = build_config(&args(&["--delay1", "75", "--loss2", "2", "--cc", "reno", "tcp"])).unwrap();
        assert_eq!(cfg.link1.delay_ms, 75.0);
        assert_eq!(cfg.link2.loss_percent, 2.0);
        assert_eq!(cfg.link1.bandwidth_mbps, 10.0);
        assert_eq!(cfg.aux, Auxiliary::None);
    }

    #[test]
    fn protocol_selects_relay_process() {
        let cfg = build_config(&args(&["pep"])).unwrap();
        assert_eq!(cfg.aux, Auxiliary::Proxy);

        let cfg = build_config(&args(&["--frequency", "16p", "--threshold", "8", "quack"])).unwrap();
        match cfg.aux {
            Auxiliary::Sidekick(sk) => {
                assert_eq!(sk.cadence, Cadence::Packets(16));
                assert_eq!(sk.threshold, 8);
            }
            other => panic!("expected sidekick, got {other:?}"),
        }
    }

    #[test]
    fn incompatible_flows_are_rejected() {
        assert!(build_config(&args(&["--second", "pep", "tcp"])).is_err());
        assert!(build_config(&args(&["--second", "quack", "quack"])).is_err());
        // Needs both relay processes at once.
        assert!(build_config(&args(&["--second", "quack", "pep"])).is_err());
        assert!(build_config(&args(&["--second", "quic", "quack"])).is_ok());
    }

    #[test]
    fn monitor_flags_select_window_source() {
        let plain = args(&["tcp"]);
        assert!(window_monitor(&plain).unwrap().is_none());
        assert_eq!(plain.monitor_host, MonitorHost::Client);
        assert_eq!(plain.interval, SS_INTERVAL_SECS);

        let ss = args(&["--monitor", "ss", "--monitor-host", "relay", "--interval", "0.5", "tcp"]);
        assert_eq!(
            window_monitor(&ss).unwrap(),
            Some(WindowMonitor::Ss { interval: Duration::from_millis(500) })
        );
        assert_eq!(Host::from(ss.monitor_host), Host::Relay);

        let iperf = args(&["--monitor", "iperf", "--duration", "30", "tcp"]);
        assert_eq!(window_monitor(&iperf).unwrap(), Some(WindowMonitor::Iperf));
        assert_eq!(iperf.duration, 30);

        assert!(window_monitor(&args(&["--monitor", "ss", "--interval", "0", "tcp"])).is_err());
        assert!(Wrapper::try_parse_from(["run", "--monitor", "ss", "--second", "quic", "tcp"]).is_err());
        assert!(Wrapper::try_parse_from(["run", "--monitor-host", "server", "tcp"]).is_err());
    }
}
