//! TCP congestion window sampling on a running path.
//!
//! Two sources: periodic `ss -t -i` snapshots on the relay or client while
//! a bulk TCP transfer runs, or an iperf3 client reporting its window every
//! 100 ms against an iperf3 server on the server host.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::config::CongestionControl;
use crate::error::{Result, SimError};
use crate::exec::{CommandRunner, HostCommand};
use crate::supervisor::{emit_line, open_append, ProcessSpec, TrialOutput};
use crate::topology::{Host, SERVER_ADDR};

/// Logged by `iperf3 -s` once it accepts connections.
pub const IPERF_READY_MARKER: &str = "Server listening";

/// Transfer size of the background TCP load sampled by `ss`.
pub const SS_LOAD_SIZE: &str = "50M";

const IPERF_RATE: &str = "20M";
const IPERF_REPORT_INTERVAL: &str = "0.1";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowMonitor {
    /// `ss -t -i` every `interval`.
    Ss { interval: Duration },
    /// iperf3 interval reports.
    Iperf,
}

impl WindowMonitor {
    pub fn name(&self) -> &'static str {
        match self {
            WindowMonitor::Ss { .. } => "ss",
            WindowMonitor::Iperf => "iperf",
        }
    }
}

/// Only the relay and the client see the server-bound connection.
pub fn check_monitor_host(host: Host) -> Result<()> {
    match host {
        Host::Relay | Host::Client => Ok(()),
        Host::Server => Err(SimError::config(format!(
            "window monitor must run on {} or {}, not {host}",
            Host::Relay,
            Host::Client
        ))),
    }
}

/// Number of `ss` snapshots fitting in `duration`.
pub fn sample_count(duration: Duration, interval: Duration) -> Result<usize> {
    if interval.is_zero() {
        return Err(SimError::config("sampling interval must be positive"));
    }
    Ok((duration.as_secs_f64() / interval.as_secs_f64()) as usize)
}

/// Window lines of connections to `peer` in one `ss -t -i` snapshot: the
/// detail line following each matching connection line.
pub fn ss_cwnd_lines(stdout: &str, peer: &str) -> Vec<String> {
    let lines: Vec<&str> = stdout.lines().collect();
    lines
        .windows(2)
        .filter(|w| w[0].trim_end().ends_with(peer) && w[1].contains("cwnd"))
        .map(|w| w[1].trim().to_string())
        .collect()
}

/// Takes `samples` snapshots on `host`, `interval` apart, keeping the
/// window lines of HTTPS connections to the server.
pub fn sample_ss(
    runner: &dyn CommandRunner,
    host: Host,
    samples: usize,
    interval: Duration,
    log: Option<&Path>,
    echo: bool,
) -> Result<TrialOutput> {
    let peer = format!("{SERVER_ADDR}:https");
    let cmd = HostCommand::on(host.name(), "ss").args(["-t", "-i"]);
    let mut log = log.map(open_append).transpose()?;
    let mut output = TrialOutput {
        name: "ss".into(),
        status: Some(0),
        lines: Vec::new(),
    };

    tracing::info!(%host, samples, ?interval, "sampling TCP windows");
    for i in 0..samples {
        if i > 0 {
            thread::sleep(interval);
        }
        let snapshot = runner.check(&cmd)?;
        for line in ss_cwnd_lines(&snapshot.stdout, &peer) {
            emit_line(log.as_mut(), echo, &line)?;
            output.lines.push(line);
        }
    }
    Ok(output)
}

pub fn iperf_server(log: PathBuf) -> ProcessSpec {
    ProcessSpec {
        name: "iperf-server".into(),
        host: Some(Host::Server),
        argv: ["iperf3", "-s", "-f", "m"].map(str::to_string).to_vec(),
        log,
        env: Vec::new(),
    }
}

/// Rate-limited iperf3 client against the server host for `duration`.
pub fn iperf_client_argv(duration: Duration, cc: CongestionControl) -> Vec<String> {
    let secs = duration.as_secs().max(1).to_string();
    [
        "iperf3",
        "-c",
        SERVER_ADDR,
        "-t",
        secs.as_str(),
        "-f",
        "m",
        "-b",
        IPERF_RATE,
        "-C",
        cc.as_str(),
        "-i",
        IPERF_REPORT_INTERVAL,
    ]
    .map(str::to_string)
    .to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{unique_temp_path, RecordingRunner};

    const SS_OUTPUT: &str = "\
State  Recv-Q Send-Q Local Address:Port  Peer Address:Port
ESTAB  0      0      10.0.2.10:41234     10.0.1.10:https
\t cubic wscale:7,7 rto:256 rtt:53.1/2.4 mss:1448 cwnd:42 bytes_sent:1200000
ESTAB  0      0      10.0.2.10:41240     10.0.3.3:ssh
\t cubic wscale:7,7 rto:204 rtt:1.2/0.4 mss:1448 cwnd:10
";

    #[test]
    fn keeps_only_server_connections() {
        let lines = ss_cwnd_lines(SS_OUTPUT, "10.0.1.10:https");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("cwnd:42"));
        assert!(ss_cwnd_lines("", "10.0.1.10:https").is_empty());
    }

    #[test]
    fn samples_are_appended_to_the_log() {
        let dir = unique_temp_path("sk_monitor_ss");
        let log = dir.join("cwnd.log");
        let runner = RecordingRunner::default();
        runner.set_output("ss -t -i", SS_OUTPUT);

        let out = sample_ss(&runner, Host::Client, 3, Duration::from_millis(1), Some(&log), false)
            .unwrap();
        assert_eq!(out.lines.len(), 3);
        assert_eq!(runner.lines(), vec!["[h2] ss -t -i"; 3]);
        let text = std::fs::read_to_string(&log).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.lines().all(|l| l.contains("cwnd:42")));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn failing_snapshot_is_an_error() {
        let runner = RecordingRunner::failing_on("ss");
        let err = sample_ss(&runner, Host::Relay, 2, Duration::from_millis(1), None, false)
            .unwrap_err();
        assert!(matches!(err, SimError::Command { .. }));
        assert_eq!(runner.commands().len(), 1);
    }

    #[test]
    fn iperf_and_sampling_parameters() {
        let argv = iperf_client_argv(Duration::from_secs(10), CongestionControl::Reno).join(" ");
        assert_eq!(argv, "iperf3 -c 10.0.1.10 -t 10 -f m -b 20M -C reno -i 0.1");
        assert_eq!(iperf_server(PathBuf::from("h1.log")).host, Some(Host::Server));

        assert_eq!(sample_count(Duration::from_secs(10), Duration::from_millis(100)).unwrap(), 100);
        assert!(sample_count(Duration::from_secs(1), Duration::ZERO).is_err());
        assert!(check_monitor_host(Host::Server).is_err());
        assert!(check_monitor_host(Host::Relay).is_ok());
    }
}
