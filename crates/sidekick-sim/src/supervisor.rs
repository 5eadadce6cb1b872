//! Starts, watches and stops the processes of a run.
//!
//! Long-lived auxiliaries (webserver, transparent proxy, sidekick sender)
//! are spawned with stdout/stderr appended to their host's log file
//! (`h1.log`, `r1.log`, ...) and tracked by [`ProcessHandle`]. Short-lived
//! trial clients run synchronously under a mandatory timeout; their
//! combined output is captured line by line, appended to an optional
//! per-flow log and optionally echoed to stdout.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::config::{Auxiliary, Programs, SidekickConfig, PROXY_PORT};
use crate::error::{Result, SimError};
use crate::exec::{CommandRunner, HostCommand, NetnsRunner};
use crate::topology::{Host, CLIENT_ADDR, RELAY_CLIENT_GW, RELAY_CLIENT_IFACE, RELAY_SERVER_IFACE};

/// Poll interval for liveness, readiness and output draining.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a stopped process gets to exit after SIGINT.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Lines of log included in a [`SimError::Process`].
const LOG_TAIL_LINES: usize = 20;

/// UDP port the client-side sidekick receiver listens on.
pub const SIDEKICK_PORT: u16 = 5103;

/// Identity of a supervised long-lived process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle(u64);

/// What to launch as a long-lived process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub name: String,
    /// Namespace to run in; `None` runs in the current one.
    pub host: Option<Host>,
    pub argv: Vec<String>,
    /// Append-only log receiving stdout and stderr.
    pub log: PathBuf,
    pub env: Vec<(String, String)>,
}

/// A short-lived trial client.
#[derive(Debug, Clone)]
pub struct TrialCommand {
    pub name: String,
    pub host: Option<Host>,
    pub argv: Vec<String>,
    /// Append-only log receiving every output line.
    pub log: Option<PathBuf>,
    /// Echo output lines to stdout as they arrive.
    pub echo: bool,
}

/// Captured result of one trial.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrialOutput {
    pub name: String,
    /// Exit code, `None` if terminated by a signal.
    pub status: Option<i32>,
    /// stdout and stderr lines in arrival order.
    pub lines: Vec<String>,
}

impl TrialOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn combined(&self) -> String {
        let mut out = self.lines.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }
}

struct Supervised {
    handle: ProcessHandle,
    name: String,
    child: Child,
    log: PathBuf,
    /// Log length when the process started; readiness only looks past it.
    log_offset: u64,
}

pub struct ProcessSupervisor {
    launcher: NetnsRunner,
    runner: Arc<dyn CommandRunner>,
    log_dir: PathBuf,
    procs: Vec<Supervised>,
    next_handle: u64,
}

impl ProcessSupervisor {
    pub fn new(launcher: NetnsRunner, runner: Arc<dyn CommandRunner>, log_dir: &Path) -> Self {
        Self {
            launcher,
            runner,
            log_dir: log_dir.to_path_buf(),
            procs: Vec::new(),
            next_handle: 0,
        }
    }

    /// Log file shared by every process started on `host`.
    pub fn host_log(&self, host: Host) -> PathBuf {
        self.log_dir.join(format!("{}.log", host.name()))
    }

    /// Runner for one-shot host commands.
    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    /// Number of supervised processes not yet stopped.
    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn start(&mut self, spec: ProcessSpec) -> Result<ProcessHandle> {
        let cmd = host_command(&spec.name, spec.host, &spec.argv)?;
        let log = open_append(&spec.log)?;
        let log_offset = log.metadata()?.len();

        let mut command = self.launcher.command(&cmd);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        tracing::info!(name = %spec.name, %cmd, log = %spec.log.display(), "starting process");
        let child = command.spawn()?;

        let handle = ProcessHandle(self.next_handle);
        self.next_handle += 1;
        self.procs.push(Supervised {
            handle,
            name: spec.name,
            child,
            log: spec.log,
            log_offset,
        });
        Ok(handle)
    }

    /// Starts the benchmark webserver on the server host and waits for it to
    /// log its readiness marker.
    pub fn start_webserver(
        &mut self,
        programs: &Programs,
        ready_timeout: Duration,
    ) -> Result<ProcessHandle> {
        let handle = self.start(ProcessSpec {
            name: "webserver".into(),
            host: Some(Host::Server),
            argv: programs.webserver.clone(),
            log: self.host_log(Host::Server),
            env: Vec::new(),
        })?;
        self.wait_ready(handle, &programs.webserver_ready_marker, ready_timeout)?;
        Ok(handle)
    }

    /// Redirects TCP arriving on either relay interface to a local
    /// transparent proxy and starts the proxy.
    pub fn start_proxy(&mut self, programs: &Programs) -> Result<ProcessHandle> {
        tracing::info!("starting the TCP proxy on {}", Host::Relay);
        let relay = Host::Relay.name();
        let port = PROXY_PORT.to_string();
        let setup = [
            HostCommand::parse(Some(relay), "ip rule add fwmark 1 lookup 100"),
            HostCommand::parse(Some(relay), "ip route add local 0.0.0.0/0 dev lo table 100"),
            HostCommand::parse(Some(relay), "iptables -t mangle -F"),
        ];
        for cmd in &setup {
            self.runner.check(cmd)?;
        }
        for iface in [RELAY_CLIENT_IFACE.iface, RELAY_SERVER_IFACE.iface] {
            self.runner.check(&HostCommand::on(relay, "iptables").args([
                "-t",
                "mangle",
                "-A",
                "PREROUTING",
                "-i",
                iface,
                "-p",
                "tcp",
                "-j",
                "TPROXY",
                "--on-port",
                port.as_str(),
                "--tproxy-mark",
                "1",
            ]))?;
        }

        self.start(ProcessSpec {
            name: "proxy".into(),
            host: Some(Host::Relay),
            argv: programs.proxy.clone(),
            log: self.host_log(Host::Relay),
            env: Vec::new(),
        })
    }

    /// Starts the sidekick sender watching the relay's client-side interface
    /// and sending digests to the client.
    pub fn start_sidekick(
        &mut self,
        programs: &Programs,
        sidekick: &SidekickConfig,
    ) -> Result<ProcessHandle> {
        tracing::info!(cadence = ?sidekick.cadence, threshold = sidekick.threshold, "starting the sidekick sender on {}", Host::Relay);
        let mut argv = programs.sidekick_sender.clone();
        argv.extend([
            "-i".to_string(),
            RELAY_CLIENT_IFACE.iface.to_string(),
            "-t".to_string(),
            sidekick.threshold.to_string(),
            "--target-addr".to_string(),
            format!("{CLIENT_ADDR}:{SIDEKICK_PORT}"),
        ]);
        argv.extend(sidekick.cadence.sender_args());
        argv.extend(["--my-addr".to_string(), RELAY_CLIENT_GW.to_string()]);

        self.start(ProcessSpec {
            name: "sidekick".into(),
            host: Some(Host::Relay),
            argv,
            log: self.host_log(Host::Relay),
            env: vec![
                ("RUST_BACKTRACE".into(), "1".into()),
                ("RUST_LOG".into(), "info".into()),
            ],
        })
    }

    /// Starts whichever relay auxiliary the configuration selects.
    pub fn start_auxiliary(
        &mut self,
        programs: &Programs,
        aux: &Auxiliary,
    ) -> Result<Option<ProcessHandle>> {
        match aux {
            Auxiliary::None => {
                tracing::info!("no relay auxiliary process");
                Ok(None)
            }
            Auxiliary::Proxy => self.start_proxy(programs).map(Some),
            Auxiliary::Sidekick(cfg) => self.start_sidekick(programs, cfg).map(Some),
        }
    }

    /// Polls the process log for `marker` until `timeout` elapses.
    pub fn wait_ready(&mut self, handle: ProcessHandle, marker: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let proc = self.get_mut(handle)?;
            if read_from(&proc.log, proc.log_offset)?.contains(marker) {
                tracing::info!(name = %proc.name, "process ready");
                return Ok(());
            }
            if let Some(status) = proc.child.try_wait()? {
                return Err(process_error(proc, &status.to_string()));
            }
            if Instant::now() >= deadline {
                return Err(process_error(
                    proc,
                    &format!("no {marker:?} within {timeout:?}"),
                ));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn is_running(&mut self, handle: ProcessHandle) -> bool {
        match self.get_mut(handle) {
            Ok(proc) => matches!(proc.child.try_wait(), Ok(None)),
            Err(_) => false,
        }
    }

    /// Fails if any supervised process has exited on its own.
    pub fn check_alive(&mut self) -> Result<()> {
        for proc in &mut self.procs {
            if let Some(status) = proc.child.try_wait()? {
                return Err(process_error(proc, &status.to_string()));
            }
        }
        Ok(())
    }

    /// Stops one process: SIGINT, then SIGKILL after a grace period.
    ///
    /// Best effort; returns the exit status if one was observed.
    pub fn stop(&mut self, handle: ProcessHandle) -> Option<ExitStatus> {
        let idx = self.procs.iter().position(|p| p.handle == handle)?;
        let mut proc = self.procs.remove(idx);
        let status = terminate(&mut proc.child);
        tracing::info!(name = %proc.name, ?status, "process stopped");
        status
    }

    /// Stops every supervised process, most recently started first.
    pub fn stop_all(&mut self) {
        while let Some(proc) = self.procs.last() {
            let handle = proc.handle;
            self.stop(handle);
        }
    }

    /// Runs one trial to completion.
    pub fn run_trial(&self, trial: &TrialCommand, timeout: Duration) -> Result<TrialOutput> {
        let mut outputs = self.run_flows(&[(trial, Duration::ZERO)], timeout)?;
        Ok(outputs.remove(0))
    }

    /// Runs two trials concurrently, the second starting `offset` after the
    /// first. Each flow's lines go to its own log; only this thread writes.
    pub fn run_concurrent(
        &self,
        first: &TrialCommand,
        second: &TrialCommand,
        offset: Duration,
        timeout: Duration,
    ) -> Result<(TrialOutput, TrialOutput)> {
        let mut outputs = self.run_flows(&[(first, Duration::ZERO), (second, offset)], timeout)?;
        let second = outputs.remove(1);
        let first = outputs.remove(0);
        Ok((first, second))
    }

    fn run_flows(&self, flows: &[(&TrialCommand, Duration)], timeout: Duration) -> Result<Vec<TrialOutput>> {
        let start = Instant::now();
        let deadline = start + timeout;
        let (tx, rx) = unbounded::<(usize, String)>();
        let mut states: Vec<FlowState> = Vec::with_capacity(flows.len());

        for (idx, (trial, offset)) in flows.iter().enumerate() {
            let wait = offset.saturating_sub(start.elapsed());
            if !wait.is_zero() {
                thread::sleep(wait);
            }
            match self.spawn_flow(idx, trial, &tx) {
                Ok(state) => states.push(state),
                Err(e) => {
                    for state in &mut states {
                        terminate(&mut state.child);
                    }
                    return Err(e);
                }
            }
        }
        drop(tx);

        if let Err(e) = collect_flows(&mut states, &rx, deadline, timeout) {
            // Children outlive a dropped `Child`; stop them before returning.
            for state in &mut states {
                terminate(&mut state.child);
            }
            return Err(e);
        }

        Ok(states
            .into_iter()
            .map(|s| {
                tracing::debug!(name = %s.output.name, status = ?s.output.status, lines = s.output.lines.len(), "trial finished");
                s.output
            })
            .collect())
    }

    fn spawn_flow(&self, idx: usize, trial: &TrialCommand, tx: &Sender<(usize, String)>) -> Result<FlowState> {
        let cmd = host_command(&trial.name, trial.host, &trial.argv)?;
        let log = trial.log.as_deref().map(open_append).transpose()?;
        let mut command = self.launcher.command(&cmd);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::info!(name = %trial.name, %cmd, "starting trial");
        let mut child = command.spawn()?;
        if let Some(out) = child.stdout.take() {
            spawn_line_reader(idx, out, tx.clone());
        }
        if let Some(err) = child.stderr.take() {
            spawn_line_reader(idx, err, tx.clone());
        }

        Ok(FlowState {
            child,
            log,
            echo: trial.echo,
            output: TrialOutput {
                name: trial.name.clone(),
                status: None,
                lines: Vec::new(),
            },
        })
    }

    fn get_mut(&mut self, handle: ProcessHandle) -> Result<&mut Supervised> {
        self.procs
            .iter_mut()
            .find(|p| p.handle == handle)
            .ok_or_else(|| SimError::config(format!("unknown process handle {handle:?}")))
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if !self.procs.is_empty() {
            tracing::warn!(count = self.procs.len(), "supervisor dropped with live processes");
            self.stop_all();
        }
    }
}

struct FlowState {
    child: Child,
    log: Option<File>,
    echo: bool,
    output: TrialOutput,
}

impl FlowState {
    fn record(&mut self, line: String) -> Result<()> {
        emit_line(self.log.as_mut(), self.echo, &line)?;
        self.output.lines.push(line);
        Ok(())
    }
}

/// Appends `line` to `log` and, with `echo`, to stdout.
pub(crate) fn emit_line(log: Option<&mut File>, echo: bool, line: &str) -> io::Result<()> {
    if let Some(log) = log {
        writeln!(log, "{line}")?;
    }
    if echo {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{line}")?;
        stdout.flush()?;
    }
    Ok(())
}

/// Drains output until every reader hit EOF, then reaps every child.
fn collect_flows(
    states: &mut [FlowState],
    rx: &Receiver<(usize, String)>,
    deadline: Instant,
    timeout: Duration,
) -> Result<()> {
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok((idx, line)) => states[idx].record(line)?,
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if Instant::now() >= deadline {
            return Err(abort_flows(states, timeout));
        }
    }

    for idx in 0..states.len() {
        loop {
            if let Some(status) = states[idx].child.try_wait()? {
                states[idx].output.status = status.code();
                break;
            }
            if Instant::now() >= deadline {
                return Err(abort_flows(states, timeout));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
    Ok(())
}

fn abort_flows(states: &mut [FlowState], timeout: Duration) -> SimError {
    let names: Vec<&str> = states.iter().map(|s| s.output.name.as_str()).collect();
    let name = names.join("+");
    for state in states.iter_mut() {
        terminate(&mut state.child);
    }
    tracing::warn!(%name, ?timeout, "trial timed out");
    SimError::Timeout { name, timeout }
}

fn host_command(name: &str, host: Option<Host>, argv: &[String]) -> Result<HostCommand> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| SimError::config(format!("{name}: empty command line")))?;
    Ok(HostCommand {
        host: host.map(|h| h.name().to_string()),
        program: program.clone(),
        args: args.to_vec(),
    })
}

fn spawn_line_reader<R: Read + Send + 'static>(idx: usize, stream: R, tx: Sender<(usize, String)>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send((idx, line)).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// SIGINT for a clean exit, SIGKILL if it does not come within the grace period.
fn terminate(child: &mut Child) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    #[cfg(unix)]
    {
        let pid = child.id() as libc::pid_t;
        // SAFETY: `child.id()` returns the OS process ID of our child, which
        // has not been reaped yet. Worst case is a no-op (ESRCH).
        unsafe {
            libc::kill(pid, libc::SIGINT);
        }
    }

    match wait_with_timeout(child, STOP_GRACE) {
        Ok(Some(status)) => Some(status),
        _ => {
            tracing::warn!(pid = child.id(), "process didn't exit cleanly, killing");
            let _ = child.kill();
            child.wait().ok()
        }
    }
}

/// Wait for a child process with a timeout. `Ok(None)` means it is still running.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

fn process_error(proc: &Supervised, status: &str) -> SimError {
    let tail = read_from(&proc.log, proc.log_offset)
        .map(|text| tail_lines(&text, LOG_TAIL_LINES))
        .unwrap_or_default();
    SimError::Process {
        name: proc.name.clone(),
        status: status.to_string(),
        tail,
    }
}

/// Opens `path` for appending, creating it and its parent directory.
pub fn open_append(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn read_from(path: &Path, offset: u64) -> io::Result<String> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{unique_temp_path, RecordingRunner};

    fn supervisor(dir: &Path) -> ProcessSupervisor {
        ProcessSupervisor::new(
            NetnsRunner::new(false),
            Arc::new(RecordingRunner::default()),
            dir,
        )
    }

    fn sh(name: &str, script: &str) -> TrialCommand {
        TrialCommand {
            name: name.into(),
            host: None,
            argv: vec!["sh".into(), "-c".into(), script.into()],
            log: None,
            echo: false,
        }
    }

    #[test]
    fn trial_captures_stdout_and_stderr() {
        let dir = unique_temp_path("sk_sup_trial");
        let sup = supervisor(&dir);
        let out = sup
            .run_trial(&sh("t", "echo one; echo two 1>&2; exit 2"), Duration::from_secs(10))
            .unwrap();
        assert_eq!(out.status, Some(2));
        assert_eq!(out.lines.len(), 2);
        assert!(out.lines.contains(&"one".to_string()));
        assert!(out.lines.contains(&"two".to_string()));
    }

    #[test]
    fn trial_timeout_kills_process() {
        let dir = unique_temp_path("sk_sup_timeout");
        let sup = supervisor(&dir);
        let started = Instant::now();
        let err = sup
            .run_trial(&sh("slow", "sleep 30"), Duration::from_millis(300))
            .unwrap_err();
        assert!(matches!(err, SimError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn concurrent_flows_append_to_separate_logs() {
        let dir = unique_temp_path("sk_sup_flows");
        let sup = supervisor(&dir);
        let f1_log = dir.join("f1.log");
        let f2_log = dir.join("f2.log");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(&f1_log, "previous\n").unwrap();

        let mut f1 = sh("f1", "echo a1; echo a2");
        f1.log = Some(f1_log.clone());
        let mut f2 = sh("f2", "echo b1");
        f2.log = Some(f2_log.clone());

        let (o1, o2) = sup
            .run_concurrent(&f1, &f2, Duration::from_millis(50), Duration::from_secs(10))
            .unwrap();
        assert_eq!(o1.lines, vec!["a1", "a2"]);
        assert_eq!(o2.lines, vec!["b1"]);
        assert_eq!(std::fs::read_to_string(&f1_log).unwrap(), "previous\na1\na2\n");
        assert_eq!(std::fs::read_to_string(&f2_log).unwrap(), "b1\n");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn readiness_marker_and_stop() {
        let dir = unique_temp_path("sk_sup_ready");
        let mut sup = supervisor(&dir);
        let log = dir.join("h1.log");
        std::fs::create_dir_all(&dir).unwrap();
        // a stale marker from an earlier run must not count
        std::fs::write(&log, "Starting httpd\n").unwrap();

        let handle = sup
            .start(ProcessSpec {
                name: "server".into(),
                host: None,
                argv: vec![
                    "sh".into(),
                    "-c".into(),
                    "sleep 0.3; echo Starting httpd; sleep 30".into(),
                ],
                log: log.clone(),
                env: Vec::new(),
            })
            .unwrap();
        let started = Instant::now();
        sup.wait_ready(handle, "Starting httpd", Duration::from_secs(10))
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(sup.is_running(handle));
        sup.check_alive().unwrap();

        sup.stop(handle);
        assert!(sup.is_empty());
        assert!(!sup.is_running(handle));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn early_exit_is_a_process_error_with_tail() {
        let dir = unique_temp_path("sk_sup_exit");
        let mut sup = supervisor(&dir);
        let handle = sup
            .start(ProcessSpec {
                name: "proxy".into(),
                host: None,
                argv: vec!["sh".into(), "-c".into(), "echo bind failed; exit 1".into()],
                log: dir.join("r1.log"),
                env: Vec::new(),
            })
            .unwrap();
        match sup.wait_ready(handle, "listening", Duration::from_secs(10)) {
            Err(SimError::Process { name, tail, .. }) => {
                assert_eq!(name, "proxy");
                assert!(tail.contains("bind failed"));
            }
            other => panic!("expected process error, got {other:?}"),
        }
        assert!(sup.check_alive().is_err());
        sup.stop_all();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn proxy_setup_marks_tcp_on_both_relay_interfaces() {
        let dir = unique_temp_path("sk_sup_proxy");
        let runner = Arc::new(RecordingRunner::default());
        let mut sup = ProcessSupervisor::new(NetnsRunner::new(false), runner.clone(), &dir);
        let programs = Programs {
            proxy: vec!["true".into()],
            ..Programs::default()
        };
        // `ip netns exec r1 true` fails without namespaces; only the
        // policy-routing commands are under test here.
        let _ = sup.start_proxy(&programs);
        sup.stop_all();
        let lines = runner.lines();
        assert_eq!(lines[0], "[r1] ip rule add fwmark 1 lookup 100");
        assert_eq!(lines[1], "[r1] ip route add local 0.0.0.0/0 dev lo table 100");
        assert_eq!(lines[2], "[r1] iptables -t mangle -F");
        assert!(lines[3].contains("-i r1-eth1 -p tcp -j TPROXY --on-port 5000"));
        assert!(lines[4].contains("-i r1-eth0 -p tcp -j TPROXY --on-port 5000"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn failed_flow_log_write_stops_the_client() {
        let dir = unique_temp_path("sk_sup_logfail");
        std::fs::create_dir_all(&dir).unwrap();
        let pid_file = dir.join("pid");
        let sup = supervisor(&dir);
        // Writes to /dev/full fail with ENOSPC on the first line.
        let mut trial = sh(
            "f1",
            &format!("echo $$ > {}; echo hello; exec sleep 30", pid_file.display()),
        );
        trial.log = Some(PathBuf::from("/dev/full"));

        let started = Instant::now();
        let err = sup.run_trial(&trial, Duration::from_secs(20)).unwrap_err();
        assert!(matches!(err, SimError::Io(_)), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let proc_dir = PathBuf::from(format!("/proc/{}", pid.trim()));
        assert!(!proc_dir.exists(), "client {} still running", pid.trim());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail_lines("a", 5), "a");
    }
}
