//! One-shot batch execution.

use std::time::Duration;

use control_link_core::SharedClock;
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use super::{QueueCommand, QueueSummary, StepSpec, StepStatus, execute_step};
use crate::registry::OperationRegistry;

/// Batch options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Run all entries concurrently. Entries give no ordering guarantee.
    pub parallel: bool,
    /// Sequential mode only: after a failure, skip every remaining entry.
    pub stop_on_error: bool,
    pub timeout: Duration,
}

/// Settled batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    /// No failures and no skips.
    pub success: bool,
    pub results: Vec<QueueCommand>,
    pub summary: QueueSummary,
}

/// Run a batch to completion.
pub async fn run_batch(
    registry: &OperationRegistry,
    clock: &SharedClock,
    steps: Vec<StepSpec>,
    options: BatchOptions,
) -> BatchResult {
    let start = clock.now_millis();
    let mut commands: Vec<QueueCommand> = steps
        .into_iter()
        .enumerate()
        .map(|(index, spec)| QueueCommand::pending(index, spec))
        .collect();
    tracing::debug!(total = commands.len(), parallel = options.parallel, "Running batch");

    if options.parallel {
        for command in &mut commands {
            command.start(start);
        }
        let outcomes = join_all(commands.iter().map(|command| async move {
            let outcome = execute_step(
                registry,
                &command.command_type,
                command.params.clone(),
                options.timeout,
            )
            .await;
            (outcome, clock.now_millis())
        }))
        .await;
        for (command, (outcome, end)) in commands.iter_mut().zip(outcomes) {
            command.settle(outcome, end);
        }
    } else {
        let mut halted = false;
        for command in &mut commands {
            if halted {
                command.status = StepStatus::Skipped;
                continue;
            }
            command.start(clock.now_millis());
            let outcome = execute_step(
                registry,
                &command.command_type,
                command.params.clone(),
                options.timeout,
            )
            .await;
            command.settle(outcome, clock.now_millis());
            if command.status == StepStatus::Failed && options.stop_on_error {
                tracing::debug!(index = command.index, "Batch halted on error");
                halted = true;
            }
        }
    }

    let summary = QueueSummary::from_steps(&commands, clock.now_millis() - start);
    BatchResult {
        success: summary.failed == 0 && summary.skipped == 0,
        results: commands,
        summary,
    }
}
