//! `harvest`: parse accumulated benchmark logs, reconcile them against the
//! expected sweep and write the summarised series as JSON.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, ValueEnum};

use sidekick_harvest::condition::{Axis, Condition};
use sidekick_harvest::parser::{ParseAnomaly, ParserConfig};
use sidekick_harvest::reconcile::TrialReconciler;
use sidekick_harvest::stats::Aggregation;
use sidekick_harvest::sweep::{self, Normalization, Series, SeriesDocument};
use sidekick_sim::experiment::data_size_kb;
use sidekick_sim::protocol::Protocol;

use crate::executor::{RunTemplate, SubprocessExecutor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AxisArg {
    /// Throughput against relay ↔ client (or far-link) loss.
    Loss,
    /// Throughput against transfer size at a fixed loss.
    DataSize,
}

impl From<AxisArg> for Axis {
    fn from(a: AxisArg) -> Self {
        match a {
            AxisArg::Loss => Axis::Loss,
            AxisArg::DataSize => Axis::DataSize,
        }
    }
}

#[derive(Args, Debug)]
pub struct HarvestArgs {
    #[arg(long, value_enum, default_value_t = AxisArg::Loss)]
    pub axis: AxisArg,
    /// Protocols to harvest; all of them when omitted.
    #[arg(long = "protocol")]
    pub protocols: Vec<Protocol>,
    /// Trials expected per condition.
    #[arg(short = 't', long, default_value_t = 10)]
    pub trials: usize,
    /// Largest x to include: hundredths of a percent for loss, kB for data size.
    #[arg(long)]
    pub max_x: Option<u64>,

    /// Data size of a loss sweep.
    #[arg(short = 'n', long, default_value = "10M")]
    pub data_size: String,
    /// Relay ↔ client loss in percent during a data-size sweep.
    #[arg(long, default_value_t = 0.0)]
    pub loss: f64,
    #[arg(long, default_value_t = 10.0)]
    pub bw1: f64,
    #[arg(long, default_value_t = 100.0)]
    pub bw2: f64,
    #[arg(long, default_value_t = 25.0)]
    pub delay1: f64,
    #[arg(long, default_value_t = 1.0)]
    pub delay2: f64,
    #[arg(long, default_value = "cubic")]
    pub cc: String,
    /// Sidekick cadence used when backfilling quack trials.
    #[arg(long, default_value = "30ms")]
    pub frequency: String,
    #[arg(long, default_value_t = 10)]
    pub threshold: u32,
    /// Loss is applied to the server ↔ relay link.
    #[arg(long, default_value_t = false)]
    pub far_loss: bool,

    /// Run missing trials instead of only reporting them.
    #[arg(long, default_value_t = false)]
    pub execute: bool,
    /// Plot mean ± stdev instead of the median with quartiles.
    #[arg(long, default_value_t = false)]
    pub mean: bool,
    /// Per-trial timeout for backfilled runs, in seconds.
    #[arg(long, default_value_t = 120)]
    pub timeout: u64,
    #[arg(long, default_value_t = false)]
    pub no_sudo: bool,

    #[arg(long, default_value = "results")]
    pub logdir: PathBuf,
    #[arg(long, default_value = "figures")]
    pub outdir: PathBuf,
    /// Extra arguments passed to every backfilled `run`.
    #[arg(long = "args", num_args = 1.., allow_hyphen_values = true)]
    pub extra: Vec<String>,
}

impl HarvestArgs {
    fn protocols(&self) -> Vec<Protocol> {
        if self.protocols.is_empty() {
            Protocol::ALL.to_vec()
        } else {
            self.protocols.clone()
        }
    }

    /// Directory holding one `<protocol>.txt` log per protocol.
    pub fn log_dir(&self) -> PathBuf {
        match self.axis {
            AxisArg::Loss => self
                .logdir
                .join("loss_tput")
                .join(format!("bw{}", self.bw2))
                .join(&self.data_size)
                .join(format!("{}ms_{}ms", self.delay1, self.delay2)),
            AxisArg::DataSize => self
                .logdir
                .join("data_size")
                .join(format!("loss{}p", self.loss))
                .join(&self.cc),
        }
    }

    pub fn title(&self) -> String {
        match self.axis {
            AxisArg::Loss => format!(
                "loss_tput_bw{}_{}_{}ms_{}ms",
                self.bw2, self.data_size, self.delay1, self.delay2
            ),
            AxisArg::DataSize => format!("data_size_loss{}p_{}", self.loss, self.cc),
        }
    }

    fn xs(&self) -> Vec<u64> {
        match self.axis {
            AxisArg::Loss => sweep::loss_xs(self.max_x.unwrap_or(800)),
            AxisArg::DataSize => sweep::data_size_xs(self.max_x.unwrap_or(100_000)),
        }
    }

    fn parser_config(&self, base: Condition) -> ParserConfig {
        let cap = Some(self.trials);
        match self.axis {
            AxisArg::Loss => ParserConfig::loss_sweep(base, if self.far_loss { 1 } else { 2 }, cap),
            AxisArg::DataSize => ParserConfig::data_size_sweep(base, cap),
        }
    }

    fn normalization(&self) -> anyhow::Result<Normalization> {
        Ok(match self.axis {
            // Elapsed seconds for a fixed payload → Mbit/s.
            AxisArg::Loss => Normalization::Fixed {
                divisor: data_size_kb(&self.data_size)? as f64 / 1000.0 * 8.0,
            },
            AxisArg::DataSize => Normalization::PerDataSize,
        })
    }

    fn template(&self) -> anyhow::Result<RunTemplate> {
        Ok(RunTemplate {
            program: std::env::current_exe().context("locating the benchmark binary")?,
            sudo: !self.no_sudo,
            axis: self.axis.into(),
            far_loss: self.far_loss,
            bw1: self.bw1,
            bw2: self.bw2,
            delay1: self.delay1,
            delay2: self.delay2,
            data_size: self.data_size.clone(),
            loss: self.loss,
            timeout: self.timeout,
            frequency: self.frequency.clone(),
            threshold: self.threshold,
            extra: self.extra.clone(),
        })
    }
}

/// One line per anomaly kind, e.g. `ShortLine x3 (first at line 17)`.
fn summarize_anomalies(anomalies: &[ParseAnomaly]) -> Vec<String> {
    let mut by_kind: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for a in anomalies {
        let kind = format!("{:?}", a.kind);
        let entry = by_kind.entry(kind).or_insert((0, a.line));
        entry.0 += 1;
    }
    by_kind
        .into_iter()
        .map(|(kind, (n, first))| format!("{kind} x{n} (first at line {first})"))
        .collect()
}

pub fn run(args: HarvestArgs) -> anyhow::Result<()> {
    if args.trials == 0 {
        anyhow::bail!("--trials must be at least 1");
    }
    let axis: Axis = args.axis.into();
    let xs = args.xs();
    let normalization = args.normalization()?;
    let aggregation = if args.mean {
        Aggregation::Mean
    } else {
        Aggregation::Median
    };
    let log_dir = args.log_dir();
    let mut executor = SubprocessExecutor::new(args.template()?, true);

    let mut document = SeriesDocument {
        title: args.title(),
        series: Vec::new(),
    };
    let mut remaining = 0;
    for protocol in args.protocols() {
        let base = Condition::new(protocol.as_str(), &args.cc);
        let parser = args.parser_config(base.clone());
        let targets = sweep::targets(&base, axis, &xs, args.trials);
        let log = log_dir.join(format!("{}.txt", protocol.as_str()));

        let rec = TrialReconciler::new(&parser, targets, args.execute)
            .reconcile(&log, &mut executor)
            .with_context(|| format!("reconciling {}", log.display()))?;
        print_report(&log, &rec.after.render(&log), &rec.output.anomalies)?;
        remaining += rec.after.total_missing();
        tracing::info!(
            protocol = %protocol,
            conditions = rec.output.matrix.len(),
            invocations = rec.invocations,
            "parsed"
        );

        let series = Series::build(&rec.output.matrix, &base, axis, &xs, aggregation, normalization)
            .with_context(|| format!("summarising {}", log.display()))?;
        document.series.push(series);
    }

    let path = write_document(&args.outdir, &document)?;
    tracing::info!(path = %path.display(), missing = remaining, "wrote series");
    Ok(())
}

fn print_report(log: &Path, deficits: &[String], anomalies: &[ParseAnomaly]) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    for line in deficits {
        writeln!(out, "{line}")?;
    }
    for line in summarize_anomalies(anomalies) {
        writeln!(out, "{}: {line}", log.display())?;
    }
    Ok(())
}

fn write_document(outdir: &Path, document: &SeriesDocument) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(outdir)
        .with_context(|| format!("creating {}", outdir.display()))?;
    let path = outdir.join(format!("{}.json", document.title));
    std::fs::write(&path, document.to_json()?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
