//! Trial matrix reconciliation.
//!
//! Compares a parsed log against the expected trial count of every target
//! condition and, when allowed, asks a [`TrialExecutor`] to run exactly the
//! missing trials. Executors append to the log; the log is then re-parsed
//! to confirm the deficits closed.

use std::path::Path;

use serde::Serialize;

use crate::condition::{Condition, TrialMatrix};
use crate::error::Result;
use crate::parser::{parse_file, ParseOutput, ParserConfig};

/// An expected condition and how many trials it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub condition: Condition,
    pub trials: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deficit {
    pub condition: Condition,
    pub collected: usize,
    pub target: usize,
}

impl Deficit {
    pub fn missing(&self) -> usize {
        self.target.saturating_sub(self.collected)
    }

    /// Nothing at all was collected.
    pub fn is_total(&self) -> bool {
        self.collected == 0
    }
}

/// Itemised deficits, in target order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeficitReport {
    pub deficits: Vec<Deficit>,
}

impl DeficitReport {
    pub fn compute(matrix: &TrialMatrix, targets: &[Target]) -> Self {
        let deficits = targets
            .iter()
            .map(|t| Deficit {
                condition: t.condition.clone(),
                collected: matrix.count(&t.condition),
                target: t.trials,
            })
            .filter(|d| d.missing() > 0)
            .collect();
        Self { deficits }
    }

    pub fn is_empty(&self) -> bool {
        self.deficits.is_empty()
    }

    pub fn total_missing(&self) -> usize {
        self.deficits.iter().map(Deficit::missing).sum()
    }

    /// Conditions with no trials at all.
    pub fn missing_entirely(&self) -> impl Iterator<Item = &Condition> {
        self.deficits
            .iter()
            .filter(|d| d.is_total())
            .map(|d| &d.condition)
    }

    /// Human-readable lines: one per partial deficit, then one listing the
    /// entirely missing conditions.
    pub fn render(&self, log: &Path) -> Vec<String> {
        let mut lines: Vec<String> = self
            .deficits
            .iter()
            .filter(|d| !d.is_total())
            .map(|d| {
                format!(
                    "{} {}/{} {}",
                    d.condition,
                    d.collected,
                    d.target,
                    log.display()
                )
            })
            .collect();
        let total: Vec<String> = self.missing_entirely().map(ToString::to_string).collect();
        if !total.is_empty() {
            lines.push(format!("missing [{}]", total.join(", ")));
        }
        lines
    }
}

/// Runs trials for a condition, appending their output to `log`.
pub trait TrialExecutor {
    fn execute(&mut self, condition: &Condition, trials: usize, log: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct Reconciliation {
    /// Deficits found on the first parse.
    pub before: DeficitReport,
    /// Deficits left after backfilling (equal to `before` when not executing).
    pub after: DeficitReport,
    /// Executor invocations issued.
    pub invocations: usize,
    #[serde(skip)]
    pub output: ParseOutput,
}

pub struct TrialReconciler<'a> {
    parser: &'a ParserConfig,
    targets: Vec<Target>,
    execute: bool,
}

impl<'a> TrialReconciler<'a> {
    pub fn new(parser: &'a ParserConfig, targets: Vec<Target>, execute: bool) -> Self {
        Self {
            parser,
            targets,
            execute,
        }
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Parses `log`, reports deficits and backfills them if permitted.
    ///
    /// A fully satisfied log never reaches the executor.
    pub fn reconcile(&self, log: &Path, executor: &mut dyn TrialExecutor) -> Result<Reconciliation> {
        let output = parse_file(self.parser, log)?;
        let before = DeficitReport::compute(&output.matrix, &self.targets);
        if before.is_empty() || !self.execute {
            if !before.is_empty() {
                tracing::info!(
                    log = %log.display(),
                    conditions = before.deficits.len(),
                    trials = before.total_missing(),
                    "missing trials (not executing)"
                );
            }
            return Ok(Reconciliation {
                after: before.clone(),
                before,
                invocations: 0,
                output,
            });
        }

        let mut invocations = 0;
        for deficit in &before.deficits {
            tracing::info!(
                condition = %deficit.condition,
                missing = deficit.missing(),
                "backfilling"
            );
            executor.execute(&deficit.condition, deficit.missing(), log)?;
            invocations += 1;
        }

        let output = parse_file(self.parser, log)?;
        let after = DeficitReport::compute(&output.matrix, &self.targets);
        if !after.is_empty() {
            tracing::warn!(
                log = %log.display(),
                trials = after.total_missing(),
                "deficits remain after backfilling"
            );
        }
        Ok(Reconciliation {
            before,
            after,
            invocations,
            output,
        })
    }
}
