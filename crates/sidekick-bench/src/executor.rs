//! Backfills missing trials by re-invoking this binary's `run` command.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use sidekick_harvest::condition::{format_loss, Axis, Condition};
use sidekick_harvest::reconcile::TrialExecutor;
use sidekick_harvest::{HarvestError, Result};
use sidekick_sim::protocol::Protocol;

/// Parameters shared by every backfill run of one sweep.
#[derive(Debug, Clone)]
pub struct RunTemplate {
    pub program: PathBuf,
    pub sudo: bool,
    pub axis: Axis,
    /// Vary loss on the server ↔ relay link instead of relay ↔ client.
    pub far_loss: bool,
    pub bw1: f64,
    pub bw2: f64,
    pub delay1: f64,
    pub delay2: f64,
    /// Data size of a loss sweep.
    pub data_size: String,
    /// Relay ↔ client loss in percent during a data-size sweep.
    pub loss: f64,
    pub timeout: u64,
    pub frequency: String,
    pub threshold: u32,
    /// Appended verbatim before the protocol.
    pub extra: Vec<String>,
}

impl RunTemplate {
    /// argv running `trials` trials of `condition`.
    pub fn argv(&self, condition: &Condition, trials: usize) -> Result<Vec<String>> {
        let protocol: Protocol = condition.protocol.parse().map_err(|e| HarvestError::Execute {
            condition: condition.clone(),
            reason: format!("{e}"),
        })?;
        let missing = |what: &str| HarvestError::Execute {
            condition: condition.clone(),
            reason: format!("condition has no {what}"),
        };

        let mut argv = Vec::new();
        if self.sudo {
            argv.extend(["sudo".to_string(), "-E".to_string()]);
        }
        argv.push(self.program.display().to_string());
        argv.push("run".into());
        let mut push = |flag: &str, value: String| {
            argv.push(flag.to_string());
            argv.push(value);
        };
        push("--cc", condition.cc.clone());
        push("-t", trials.to_string());
        push("--timeout", self.timeout.to_string());
        push("--bw1", self.bw1.to_string());
        push("--bw2", self.bw2.to_string());
        push("--delay1", self.delay1.to_string());
        push("--delay2", self.delay2.to_string());
        match self.axis {
            Axis::Loss => {
                let loss = format_loss(condition.loss.ok_or_else(|| missing("loss"))?);
                push("-n", self.data_size.clone());
                if self.far_loss {
                    push("--loss1", loss);
                    push("--loss2", "0".into());
                } else {
                    push("--loss1", "0".into());
                    push("--loss2", loss);
                }
            }
            Axis::DataSize => {
                let kb = condition.data_size_kb.ok_or_else(|| missing("data size"))?;
                push("-n", format!("{kb}k"));
                push("--loss2", self.loss.to_string());
            }
        }
        if protocol.needs_sidekick() {
            push("--frequency", self.frequency.clone());
            push("--threshold", self.threshold.to_string());
        }
        argv.extend(self.extra.iter().cloned());
        argv.push(protocol.as_str().to_string());
        Ok(argv)
    }
}

/// Allowance for building the network and starting the server processes of
/// one backfill run, on top of its per-trial timeouts.
const SETUP_ALLOWANCE: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs the backfill command and appends its command line and stdout to
/// the log. stderr goes to the terminal.
pub struct SubprocessExecutor {
    template: RunTemplate,
    echo: bool,
    limit: Option<Duration>,
}

impl SubprocessExecutor {
    pub fn new(template: RunTemplate, echo: bool) -> Self {
        Self {
            template,
            echo,
            limit: None,
        }
    }

    /// Overrides the wall-clock limit of one backfill run.
    pub fn with_limit(mut self, limit: Duration) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Every trial may use its full timeout, plus setup.
    fn limit(&self, trials: usize) -> Duration {
        self.limit.unwrap_or_else(|| {
            let trials = u32::try_from(trials).unwrap_or(u32::MAX);
            Duration::from_secs(self.template.timeout).saturating_mul(trials) + SETUP_ALLOWANCE
        })
    }
}

impl TrialExecutor for SubprocessExecutor {
    fn execute(&mut self, condition: &Condition, trials: usize, log: &Path) -> Result<()> {
        let argv = self.template.argv(condition, trials)?;
        let line = argv.join(" ");
        let limit = self.limit(trials);
        tracing::info!(%condition, trials, cmd = %line, ?limit, "executing");

        if let Some(dir) = log.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(log)?;
        // A blank line closes whatever block the log ended with.
        writeln!(file, "\n{line}")?;

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let echo = self.echo;
        let tee = child
            .stdout
            .take()
            .map(|stdout| thread::spawn(move || tee_lines(stdout, file, echo)));

        let status = match wait_with_deadline(&mut child, limit) {
            Ok(Some(status)) => status,
            Ok(None) => {
                kill_and_reap(&mut child);
                return Err(HarvestError::Execute {
                    condition: condition.clone(),
                    reason: format!("{line} did not finish within {limit:?}"),
                });
            }
            Err(e) => {
                kill_and_reap(&mut child);
                return Err(e.into());
            }
        };

        if let Some(tee) = tee {
            match tee.join() {
                Ok(copied) => copied?,
                Err(_) => {
                    return Err(HarvestError::Execute {
                        condition: condition.clone(),
                        reason: "output copy thread panicked".into(),
                    })
                }
            }
        }

        if !status.success() {
            return Err(HarvestError::Execute {
                condition: condition.clone(),
                reason: format!("{line} exited with {status}"),
            });
        }
        Ok(())
    }
}

/// Copies child output to the log (and stdout). Returning early drops the
/// pipe, so a child still writing gets EPIPE instead of blocking.
fn tee_lines(stdout: ChildStdout, mut file: File, echo: bool) -> io::Result<()> {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        file.write_all(&buf)?;
        if echo {
            io::stdout().write_all(&buf)?;
        }
    }
    file.flush()
}

/// `Ok(None)` if the child is still running at the deadline.
fn wait_with_deadline(child: &mut Child, limit: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn kill_and_reap(child: &mut Child) {
    tracing::warn!(pid = child.id(), "killing backfill run");
    let _ = child.kill();
    let _ = child.wait();
}
