//! One experiment run over the emulated path.
//!
//! [`Experiment::setup`] takes the run lock, builds the topology and starts
//! the webserver plus the configured relay auxiliary. Trials are bracketed
//! by interface counter snapshots. [`Experiment::shutdown`] stops every
//! supervised process before the network is released.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ExperimentConfig;
use crate::counters::{self, CounterDelta, InterfaceStatsCollector};
use crate::error::{Result, SimError};
use crate::exec::{CommandRunner, NetnsRunner};
use crate::monitor::{self, WindowMonitor};
use crate::protocol::{self, Protocol};
use crate::shaper::LinkSpec;
use crate::supervisor::{ProcessSpec, ProcessSupervisor, TrialCommand, TrialOutput};
use crate::topology::{Host, Topology, TopologyBuilder};

/// Name of the lock file created in the working directory.
pub const LOCK_FILE: &str = ".sidekick.lock";

/// Upper bound on webserver startup.
const WEBSERVER_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Exclusive claim on the emulated network, released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Creates the lock file in `dir`, failing with [`SimError::Busy`] if
    /// another run holds it.
    pub fn acquire(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                tracing::debug!(path = %path.display(), "run lock acquired");
                Ok(Self { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path).unwrap_or_default();
                Err(SimError::Busy(format!(
                    "{} is held by pid {}",
                    path.display(),
                    holder.trim()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove run lock");
        }
    }
}

/// `Link<n> delay=<d>ms loss=<l> bw=<b>`, read back by the log parser.
pub fn link_marker(n: u8, link: &LinkSpec) -> String {
    format!(
        "Link{n} delay={}ms loss={} bw={}",
        link.delay_ms, link.loss_percent, link.bandwidth_mbps
    )
}

/// `Data Size: <n>k` for a data size given as `<n>k`, `<n>M` or bytes.
pub fn data_size_marker(data_size: &str) -> Result<String> {
    Ok(format!("Data Size: {}k", data_size_kb(data_size)?))
}

/// Converts `<n>k` / `<n>M` / plain bytes to kilobytes.
pub fn data_size_kb(data_size: &str) -> Result<u64> {
    let s = data_size.trim();
    let invalid = || SimError::config(format!("invalid data size: {s}"));
    let (digits, scale) = match s.char_indices().last() {
        Some((i, 'k' | 'K')) => (&s[..i], 1),
        Some((i, 'M' | 'm')) => (&s[..i], 1000),
        Some(_) => (s, 0),
        None => return Err(invalid()),
    };
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    Ok(if scale == 0 { n / 1000 } else { n * scale })
}

/// Output of a bracketed measurement window.
#[derive(Debug, Clone, Default)]
pub struct WindowReport {
    pub trials: Vec<TrialOutput>,
    /// Per-interface counter deltas over the whole window.
    pub deltas: BTreeMap<String, CounterDelta>,
}

pub struct Experiment {
    config: ExperimentConfig,
    // Field order is drop order: processes, then network, then lock.
    supervisor: ProcessSupervisor,
    collector: InterfaceStatsCollector,
    topology: Topology,
    lock: RunLock,
}

impl Experiment {
    /// Provisions the network and starts the server-side processes.
    ///
    /// On failure everything already started is stopped and torn down.
    pub fn setup(
        config: ExperimentConfig,
        runner: Arc<dyn CommandRunner>,
        launcher: NetnsRunner,
    ) -> Result<Self> {
        let lock = RunLock::acquire(&config.workdir)?;
        let topology = TopologyBuilder::new(config.clone(), runner.clone()).build()?;
        let mut supervisor = ProcessSupervisor::new(launcher, runner.clone(), &config.workdir);

        supervisor.start_webserver(&config.programs, WEBSERVER_READY_TIMEOUT)?;
        supervisor.start_auxiliary(&config.programs, &config.aux)?;

        Ok(Self {
            collector: InterfaceStatsCollector::for_path(runner),
            config,
            supervisor,
            topology,
            lock,
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    /// Marker lines describing both links.
    pub fn link_markers(&self) -> [String; 2] {
        [
            link_marker(1, self.topology.link1()),
            link_marker(2, self.topology.link2()),
        ]
    }

    fn trial(&self, name: &str, protocol: Protocol, data_size: &str, timeout: Duration) -> TrialCommand {
        TrialCommand {
            name: name.to_string(),
            host: Some(Host::Client),
            argv: protocol.client_argv(&self.config.programs, data_size, timeout),
            log: None,
            echo: false,
        }
    }

    /// Runs `trials` sequential trials of `protocol`, echoing client output.
    pub fn run_trials(
        &mut self,
        protocol: Protocol,
        data_size: &str,
        trials: u32,
        timeout: Duration,
    ) -> Result<WindowReport> {
        protocol.check_auxiliary(&self.config.aux)?;
        let mut cmd = self.trial(protocol.as_str(), protocol, data_size, timeout);
        cmd.echo = true;

        let before = self.collector.snapshot()?;
        let mut outputs = Vec::with_capacity(trials as usize);
        for i in 0..trials {
            self.supervisor.check_alive()?;
            tracing::info!(%protocol, trial = i + 1, of = trials, data_size, "running trial");
            let out = self.supervisor.run_trial(&cmd, timeout)?;
            if !out.success() {
                tracing::warn!(%protocol, trial = i + 1, status = ?out.status, "trial client failed");
            }
            outputs.push(out);
        }
        let after = self.collector.snapshot()?;

        Ok(WindowReport {
            trials: outputs,
            deltas: counters::delta(&before, &after)?,
        })
    }

    /// Runs two flows together, the second starting `offset` after the
    /// first; each flow's output is appended to `f1.log` / `f2.log`.
    pub fn run_multiflow(
        &mut self,
        f1: Protocol,
        f2: Protocol,
        data_size: &str,
        offset: Duration,
        timeout: Duration,
    ) -> Result<WindowReport> {
        protocol::check_pairing(f1, f2)?;
        f1.check_auxiliary(&self.config.aux)?;
        f2.check_auxiliary(&self.config.aux)?;

        let mut first = self.trial("f1", f1, data_size, timeout);
        first.log = Some(self.config.workdir.join("f1.log"));
        let mut second = self.trial("f2", f2, data_size, timeout);
        second.log = Some(self.config.workdir.join("f2.log"));

        let before = self.collector.snapshot()?;
        self.supervisor.check_alive()?;
        tracing::info!(%f1, %f2, ?offset, data_size, "running two flows");
        let (o1, o2) = self.supervisor.run_concurrent(&first, &second, offset, timeout)?;
        let after = self.collector.snapshot()?;

        Ok(WindowReport {
            trials: vec![o1, o2],
            deltas: counters::delta(&before, &after)?,
        })
    }

    /// Samples the TCP congestion window on `host` for `duration`, appending
    /// the window lines to `cwnd.log` in the working directory and echoing
    /// them to stdout.
    ///
    /// With [`WindowMonitor::Ss`] a bulk TCP transfer (through the proxy if
    /// one runs) is started on the client first; with
    /// [`WindowMonitor::Iperf`] an iperf3 server is started on the server.
    pub fn monitor_window(
        &mut self,
        monitor: WindowMonitor,
        host: Host,
        duration: Duration,
        timeout: Duration,
    ) -> Result<TrialOutput> {
        monitor::check_monitor_host(host)?;
        let log = self.config.workdir.join("cwnd.log");

        let (helper, result) = match monitor {
            WindowMonitor::Ss { interval } => {
                let samples = monitor::sample_count(duration, interval)?;
                let load = self.supervisor.start(ProcessSpec {
                    name: "tcp-load".into(),
                    host: Some(Host::Client),
                    argv: Protocol::Tcp.client_argv(
                        &self.config.programs,
                        monitor::SS_LOAD_SIZE,
                        duration + Duration::from_secs(1),
                    ),
                    log: self.supervisor.host_log(Host::Client),
                    env: Vec::new(),
                })?;
                let result = monitor::sample_ss(
                    self.supervisor.runner(),
                    host,
                    samples,
                    interval,
                    Some(&log),
                    true,
                );
                (load, result)
            }
            WindowMonitor::Iperf => {
                let server = self
                    .supervisor
                    .start(monitor::iperf_server(self.supervisor.host_log(Host::Server)))?;
                let result = self
                    .supervisor
                    .wait_ready(server, monitor::IPERF_READY_MARKER, WEBSERVER_READY_TIMEOUT)
                    .and_then(|()| {
                        let client = TrialCommand {
                            name: "iperf".into(),
                            host: Some(host),
                            argv: monitor::iperf_client_argv(duration, self.config.cc),
                            log: Some(log.clone()),
                            echo: true,
                        };
                        self.supervisor.run_trial(&client, timeout)
                    });
                (server, result)
            }
        };
        self.supervisor.stop(helper);
        tracing::info!(monitor = monitor.name(), %host, log = %log.display(), "window monitor finished");
        result
    }

    /// Stops all processes, then releases the network and the lock.
    pub fn shutdown(mut self) -> Result<()> {
        self.supervisor.stop_all();
        self.topology.teardown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Programs;
    use crate::shaper::QdiscStrategy;
    use crate::test_util::{unique_temp_path, RecordingRunner};

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = unique_temp_path("sk_lock");
        let lock = RunLock::acquire(&dir).unwrap();
        assert!(lock.path().exists());
        assert!(matches!(RunLock::acquire(&dir), Err(SimError::Busy(_))));
        let path = lock.path().to_path_buf();
        drop(lock);
        assert!(!path.exists());
        let again = RunLock::acquire(&dir).unwrap();
        drop(again);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn markers() {
        let link = LinkSpec {
            bandwidth_mbps: 10.0,
            delay_ms: 25.0,
            loss_percent: 0.25,
            qdisc: QdiscStrategy::Tbf,
        };
        assert_eq!(link_marker(1, &link), "Link1 delay=25ms loss=0.25 bw=10");
        assert_eq!(data_size_marker("10M").unwrap(), "Data Size: 10000k");
        assert_eq!(data_size_marker("250k").unwrap(), "Data Size: 250k");
        assert_eq!(data_size_kb("5000").unwrap(), 5);
        assert!(data_size_kb("tenM").is_err());
        assert!(data_size_kb("").is_err());
    }

    #[test]
    fn failed_setup_releases_network_and_lock() {
        let dir = unique_temp_path("sk_setup");
        let runner = Arc::new(RecordingRunner::default());
        let mut config = ExperimentConfig::default();
        config.workdir = dir.clone();
        config.programs = Programs {
            webserver: vec!["sh".into(), "-c".into(), "exit 1".into()],
            ..Programs::default()
        };

        // The webserver runs inside h1, which does not exist here, so it
        // never becomes ready.
        let result = Experiment::setup(config, runner.clone(), NetnsRunner::new(false));
        assert!(result.is_err());
        let lines = runner.lines();
        assert!(lines.iter().any(|l| l == "ip netns del h1"));
        assert!(!dir.join(LOCK_FILE).exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
