//! Reconciliation sweep: re-derive the desired state of every access-code
//! owner at sweep time and correct whatever drifted.

use std::time::Instant;

use futures::StreamExt;
use tracing::{info, warn};

use crate::engine::now_ms;
use crate::model::*;

use super::machine::{AccessCodeError, AccessCodeMachine};

/// Local desired state disagrees with the last known remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistencyDrift {
    pub target: AccessCodeTarget,
    pub should_be_active: bool,
    pub remote_is_active: bool,
}

impl std::fmt::Display for ConsistencyDrift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: access code should be {} but is {}",
            self.target,
            if self.should_be_active { "active" } else { "inactive" },
            if self.remote_is_active { "active" } else { "inactive" },
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub in_sync: usize,
    /// Active flag flipped to match desired state.
    pub corrected: usize,
    /// Missing codes created.
    pub created: usize,
    /// Codes deleted, or found gone at the provider and reset locally.
    pub removed: usize,
    pub failed: usize,
    /// Groups whose members disagree about needing a code.
    pub mixed: usize,
}

enum Outcome {
    InSync,
    Corrected,
    Created,
    Removed,
    Failed,
}

impl AccessCodeMachine {
    /// Walk every access-code owner and converge it. Safe to run alongside
    /// live mutations: each owner is re-read when its turn comes.
    pub async fn update_access_code_is_active(&self) -> SweepReport {
        let started = Instant::now();
        let targets = self.engine.access_code_targets();
        let concurrency = self.config.sweep_concurrency.max(1);

        let outcomes: Vec<(Outcome, bool)> = futures::stream::iter(targets)
            .map(|target| self.reconcile(target))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = SweepReport {
            checked: outcomes.len(),
            ..SweepReport::default()
        };
        for (outcome, mixed) in outcomes {
            match outcome {
                Outcome::InSync => report.in_sync += 1,
                Outcome::Corrected => report.corrected += 1,
                Outcome::Created => report.created += 1,
                Outcome::Removed => report.removed += 1,
                Outcome::Failed => report.failed += 1,
            }
            if mixed {
                report.mixed += 1;
            }
        }

        metrics::histogram!(crate::observability::SWEEP_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        if report.corrected + report.created + report.removed + report.failed > 0 {
            info!(?report, "access-code sweep finished");
        } else {
            tracing::debug!(checked = report.checked, "access-code sweep found nothing to do");
        }
        report
    }

    async fn reconcile(&self, target: AccessCodeTarget) -> (Outcome, bool) {
        let entity = match self.resolve(target) {
            Ok(entity) => entity,
            // Removed since the target list was read.
            Err(AccessCodeError::UnknownEntity(_)) => return (Outcome::InSync, false),
            Err(_) => return (Outcome::Failed, false),
        };
        let now = now_ms();
        let diagnostics = entity.diagnostics(now);
        if diagnostics.mixed {
            warn!(
                target = %entity.target,
                is_access_code_is_active_correct = diagnostics.is_access_code_is_active_correct,
                "group members disagree about needing an access code"
            );
        }

        let before = entity.status;
        let has_code = before.state() != AccessCodeState::NoCode;
        if has_code && entity.uses_access_codes(now) && before.is_active != diagnostics.should_be_active {
            warn!("{}", ConsistencyDrift {
                target: entity.target,
                should_be_active: diagnostics.should_be_active,
                remote_is_active: before.is_active,
            });
        }

        let outcome = match self.converge(entity.target).await {
            Ok(after) if after == before => Outcome::InSync,
            Ok(after) if after.generated_at.is_none() => Outcome::Removed,
            Ok(_) if !has_code => Outcome::Created,
            Ok(_) => Outcome::Corrected,
            Err(e) => {
                warn!(target = %entity.target, "access-code drift left for next sweep: {e}");
                Outcome::Failed
            }
        };
        let label = match outcome {
            Outcome::Corrected | Outcome::Created | Outcome::Removed => Some("corrected"),
            Outcome::Failed => Some("failed"),
            Outcome::InSync => None,
        };
        if let Some(label) = label {
            metrics::counter!(crate::observability::DRIFT_TOTAL, "outcome" => label).increment(1);
        }
        (outcome, diagnostics.mixed)
    }
}
