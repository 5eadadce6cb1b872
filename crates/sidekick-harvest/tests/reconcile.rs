//! Reconciler behaviour against a log on disk.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use sidekick_harvest::condition::{format_loss, Axis, Condition};
use sidekick_harvest::parser::ParserConfig;
use sidekick_harvest::reconcile::{TrialExecutor, TrialReconciler};
use sidekick_harvest::sweep;
use sidekick_harvest::Result;

static SEQ: AtomicU32 = AtomicU32::new(0);

fn temp_log(prefix: &str) -> PathBuf {
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("{prefix}_{:x}_{seq}.txt", std::process::id()))
}

/// Appends synthetic trial output the way a real run would.
#[derive(Default)]
struct FakeExecutor {
    calls: Vec<(Condition, usize)>,
}

impl TrialExecutor for FakeExecutor {
    fn execute(&mut self, condition: &Condition, trials: usize, log: &Path) -> Result<()> {
        self.calls.push((condition.clone(), trials));
        let mut f = OpenOptions::new().create(true).append(true).open(log)?;
        writeln!(f, "sudo -E sidekick-bench run {}", condition.protocol)?;
        writeln!(f, "Link1 delay=25ms loss=0 bw=10")?;
        let loss = condition.loss.map(format_loss).unwrap_or_default();
        writeln!(f, "Link2 delay=1ms loss={loss} bw=100")?;
        writeln!(f, "size_download time_total exitcode")?;
        for _ in 0..trials {
            writeln!(f, "10000000 2.0 0")?;
        }
        writeln!(f)?;
        Ok(())
    }
}

fn base() -> Condition {
    Condition::new("quic", "cubic")
}

#[test]
fn backfills_then_is_idempotent() {
    let log = temp_log("sk_reconcile");
    std::fs::write(
        &log,
        "Link2 delay=1ms loss=0 bw=100\nsize_download time_total exitcode\n10000000 1.0 0\n\n",
    )
    .unwrap();

    let parser = ParserConfig::loss_sweep(base(), 2, Some(3));
    let targets = sweep::targets(&base(), Axis::Loss, &sweep::loss_xs(100), 3);
    let reconciler = TrialReconciler::new(&parser, targets, true);

    let mut exec = FakeExecutor::default();
    let first = reconciler.reconcile(&log, &mut exec).unwrap();
    assert_eq!(first.before.total_missing(), 2 + 3 + 3);
    assert!(first.after.is_empty());
    assert_eq!(first.invocations, 3);
    assert_eq!(exec.calls[0], (base().with_loss(0), 2));
    assert_eq!(exec.calls[2], (base().with_loss(100), 3));

    // The original sample is still there: the log was appended to.
    let kept = first.output.matrix.samples(&base().with_loss(0));
    assert_eq!(kept, &[1.0, 2.0, 2.0]);

    let mut idle = FakeExecutor::default();
    let second = reconciler.reconcile(&log, &mut idle).unwrap();
    assert!(second.before.is_empty());
    assert_eq!(second.invocations, 0);
    assert!(idle.calls.is_empty());

    let _ = std::fs::remove_file(&log);
}

#[test]
fn reports_without_executing() {
    let log = temp_log("sk_report");
    let parser = ParserConfig::loss_sweep(base(), 2, None);
    let targets = sweep::targets(&base(), Axis::Loss, &[0, 50], 2);
    let reconciler = TrialReconciler::new(&parser, targets, false);

    let mut exec = FakeExecutor::default();
    let result = reconciler.reconcile(&log, &mut exec).unwrap();
    assert_eq!(result.invocations, 0);
    assert!(exec.calls.is_empty());
    assert_eq!(result.before.missing_entirely().count(), 2);
    assert_eq!(result.after, result.before);
    assert!(!log.exists());
}
