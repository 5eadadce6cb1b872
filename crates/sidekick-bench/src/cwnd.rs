//! `cwnd`: steady-state congestion window and reductions per log file.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, ValueEnum};
use serde_json::json;

use sidekick_harvest::window::{per_second_average, steady_state_mean, WindowSeries, SS_INTERVAL_SECS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WindowFormat {
    /// QUIC client `<metric> <value> Instant { .. } (<reason>)` lines.
    Instant,
    /// Periodic `ss -i` samples.
    Ss,
    /// iperf interval reports.
    Iperf,
}

#[derive(Args, Debug)]
pub struct CwndArgs {
    #[arg(long, value_enum, default_value_t = WindowFormat::Instant)]
    pub format: WindowFormat,
    /// Metric name of instant lines.
    #[arg(long, default_value = "cwnd")]
    pub metric: String,
    /// Seconds between `ss` samples.
    #[arg(long, default_value_t = SS_INTERVAL_SECS)]
    pub interval: f64,
    /// Also write every series to this JSON file.
    #[arg(long)]
    pub json: Option<PathBuf>,
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

pub fn load(args: &CwndArgs, text: &str) -> WindowSeries {
    match args.format {
        WindowFormat::Instant => WindowSeries::from_instant_log(text, &args.metric),
        WindowFormat::Ss => WindowSeries::from_ss_log(text, args.interval),
        WindowFormat::Iperf => WindowSeries::from_iperf_log(text),
    }
}

pub fn run(args: CwndArgs) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    let mut entries = Vec::new();
    for path in &args.files {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let series = load(&args, &text);
        if series.is_empty() {
            tracing::warn!(path = %path.display(), "no window samples");
        }
        let packets = series.packets();
        let steady = steady_state_mean(&per_second_average(&packets));
        let decreases = series.decreases();
        let label = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        writeln!(out, "{label}: {steady:.2} packets, {} decreases", decreases.len())?;

        entries.push(json!({
            "label": label,
            "steady_state_packets": steady,
            "packets": packets,
            "decreases": decreases,
        }));
    }

    if let Some(path) = &args.json {
        let doc = serde_json::to_string_pretty(&entries)?;
        std::fs::write(path, doc).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}
