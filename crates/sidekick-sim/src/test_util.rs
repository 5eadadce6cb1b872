use std::collections::HashMap;
use std::io;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::exec::{CommandOutput, CommandRunner, HostCommand};

/// Monotonically increasing counter for generating unique test resource names.
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Check whether we have sufficient privileges (root/sudo) and tools (`ip`)
/// available to create network namespaces. Returns `false` if the test
/// environment cannot support namespace-based tests.
pub fn check_privileges() -> bool {
    match Command::new("ip").arg("netns").output() {
        Ok(o) => o.status.success(),
        Err(_) => false,
    }
}

/// A unique scratch path under the system temp dir.
///
/// Combines the prefix, process ID, and an atomic counter to avoid
/// collisions when tests run in parallel.
pub fn unique_temp_path(prefix: &str) -> std::path::PathBuf {
    let seq = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    std::env::temp_dir().join(format!("{prefix}_{pid:x}_{seq}"))
}

/// [`CommandRunner`] that records commands instead of running them.
///
/// Every command succeeds with empty output unless its program matches the
/// configured failing program, or a canned stdout was registered for its
/// command line.
#[derive(Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<HostCommand>>,
    outputs: Mutex<HashMap<String, String>>,
    fail_program: Option<String>,
}

impl RecordingRunner {
    /// A runner whose commands running `program` exit with status 1.
    pub fn failing_on(program: &str) -> Self {
        Self {
            fail_program: Some(program.to_string()),
            ..Default::default()
        }
    }

    /// Registers the stdout returned for the exact command line `line`
    /// (host prefix excluded).
    pub fn set_output(&self, line: &str, stdout: &str) {
        self.outputs
            .lock()
            .unwrap()
            .insert(line.to_string(), stdout.to_string());
    }

    pub fn commands(&self) -> Vec<HostCommand> {
        self.commands.lock().unwrap().clone()
    }

    /// Recorded commands rendered with their host prefix.
    pub fn lines(&self) -> Vec<String> {
        self.commands().iter().map(ToString::to_string).collect()
    }

    pub fn clear(&self) {
        self.commands.lock().unwrap().clear();
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, cmd: &HostCommand) -> io::Result<CommandOutput> {
        self.commands.lock().unwrap().push(cmd.clone());
        if self.fail_program.as_deref() == Some(cmd.program.as_str()) {
            return Ok(CommandOutput {
                status: Some(1),
                stdout: String::new(),
                stderr: format!("{}: simulated failure", cmd.program),
            });
        }
        let stdout = self
            .outputs
            .lock()
            .unwrap()
            .get(&cmd.line())
            .cloned()
            .unwrap_or_default();
        Ok(CommandOutput {
            status: Some(0),
            stdout,
            stderr: String::new(),
        })
    }
}
