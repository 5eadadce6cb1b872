//! Host command execution.
//!
//! Every mutation of the emulated network is a [`HostCommand`]: a program
//! plus arguments, optionally bound to a network namespace. Commands are
//! issued through a [`CommandRunner`] so that the order of shaping,
//! routing and teardown steps can be recorded and asserted without root.

use std::fmt;
use std::io;
use std::process::Command;

use crate::error::{Result, SimError};

/// A command to run on one emulated host (or on the root namespace).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    /// Namespace name, `None` for the root namespace.
    pub host: Option<String>,
    pub program: String,
    pub args: Vec<String>,
}

impl HostCommand {
    /// A command run inside namespace `host`.
    pub fn on(host: &str, program: &str) -> Self {
        Self {
            host: Some(host.to_string()),
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    /// A command run in the root namespace.
    pub fn local(program: &str) -> Self {
        Self {
            host: None,
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    /// Splits a whitespace-separated command line into program and args.
    ///
    /// Only used for fixed command templates; no quoting is interpreted.
    pub fn parse(host: Option<&str>, line: &str) -> Self {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_default();
        Self {
            host: host.map(str::to_string),
            program,
            args: parts.collect(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Full argv, wrapped in `ip netns exec` (and `sudo`) as needed.
    pub fn argv(&self, sudo: bool) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 6);
        if sudo {
            argv.push("sudo".to_string());
        }
        if let Some(host) = &self.host {
            argv.extend(["ip", "netns", "exec", host].map(str::to_string));
        }
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// The command line without host prefix, e.g. `tc qdisc add dev ...`.
    pub fn line(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "[{host}] {}", self.line()),
            None => write!(f, "{}", self.line()),
        }
    }
}

/// Captured result of a finished host command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Executes host commands synchronously.
pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: &HostCommand) -> io::Result<CommandOutput>;

    /// Runs `cmd` and turns a non-zero exit into [`SimError::Command`].
    fn check(&self, cmd: &HostCommand) -> Result<CommandOutput> {
        tracing::debug!(%cmd, "exec");
        let output = self.run(cmd)?;
        if !output.success() {
            return Err(SimError::Command {
                cmd: cmd.to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Runs `cmd`, logging but otherwise ignoring failure.
    fn best_effort(&self, cmd: &HostCommand) {
        match self.run(cmd) {
            Ok(out) if out.success() => {}
            Ok(out) => {
                tracing::debug!(%cmd, stderr = %out.stderr.trim(), "best-effort command failed")
            }
            Err(e) => tracing::debug!(%cmd, error = %e, "best-effort command failed"),
        }
    }
}

/// Runs commands for real through `ip netns exec`, optionally via `sudo`.
#[derive(Debug, Clone, Copy)]
pub struct NetnsRunner {
    pub sudo: bool,
}

impl Default for NetnsRunner {
    fn default() -> Self {
        Self { sudo: true }
    }
}

impl NetnsRunner {
    pub fn new(sudo: bool) -> Self {
        Self { sudo }
    }

    /// A [`Command`] ready to be spawned for `cmd`.
    pub fn command(&self, cmd: &HostCommand) -> Command {
        let argv = cmd.argv(self.sudo);
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        command
    }
}

impl CommandRunner for NetnsRunner {
    fn run(&self, cmd: &HostCommand) -> io::Result<CommandOutput> {
        let output = self.command(cmd).output()?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_wraps_namespace_and_sudo() {
        let cmd = HostCommand::on("r1", "tc").args(["qdisc", "show"]);
        assert_eq!(
            cmd.argv(true),
            vec!["sudo", "ip", "netns", "exec", "r1", "tc", "qdisc", "show"]
        );
        assert_eq!(cmd.argv(false), vec!["ip", "netns", "exec", "r1", "tc", "qdisc", "show"]);
        assert_eq!(HostCommand::local("ip").arg("link").argv(false), vec!["ip", "link"]);
    }

    #[test]
    fn parse_splits_template() {
        let cmd = HostCommand::parse(Some("h1"), "tc qdisc add dev h1-eth0  root");
        assert_eq!(cmd.program, "tc");
        assert_eq!(cmd.args, vec!["qdisc", "add", "dev", "h1-eth0", "root"]);
        assert_eq!(cmd.to_string(), "[h1] tc qdisc add dev h1-eth0 root");
    }

    #[test]
    fn local_runner_reports_exit_code() {
        let runner = NetnsRunner::new(false);
        let out = runner.run(&HostCommand::local("sh").args(["-c", "echo hi; exit 3"])).unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stdout.trim(), "hi");
        assert!(runner.check(&HostCommand::local("true")).is_ok());
        assert!(matches!(
            runner.check(&HostCommand::local("false")),
            Err(SimError::Command { .. })
        ));
    }
}
