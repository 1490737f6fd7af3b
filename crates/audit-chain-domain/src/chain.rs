use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::{DecisionProof, Handshake, RunId, StageName, VerificationReport, TRANSITION_ABORTED};

/// One stored position in a run's chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainLink {
    pub sequence_index: u64,
    pub handshake: Handshake,
    pub proof: DecisionProof,
}

/// A link as read back from storage. Rows that no longer decode are kept in
/// place so verification can report them instead of failing the whole load.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredLink {
    Decoded(ChainLink),
    Undecodable { sequence_index: u64, detail: String },
}

impl StoredLink {
    #[must_use]
    pub fn sequence_index(&self) -> u64 {
        match self {
            Self::Decoded(link) => link.sequence_index,
            Self::Undecodable { sequence_index, .. } => *sequence_index,
        }
    }
}

/// Run-level state derived from the chain's tail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChainOutcome {
    Empty,
    InProgress {
        last_stage: StageName,
        next_stage: StageName,
    },
    Completed {
        final_stage: StageName,
        final_outcome: String,
        transition_reason: String,
    },
    Aborted {
        stage: StageName,
    },
}

/// Ordered links of one run. Aggregates are recomputed on every call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditChain {
    run_id: RunId,
    links: Vec<ChainLink>,
}

impl AuditChain {
    #[must_use]
    pub fn new(run_id: RunId, links: Vec<ChainLink>) -> Self {
        Self { run_id, links }
    }

    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    #[must_use]
    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    #[must_use]
    pub fn tail(&self) -> Option<&ChainLink> {
        self.links.last()
    }

    #[must_use]
    pub fn ordered_handshakes(&self) -> Vec<&Handshake> {
        self.links.iter().map(|link| &link.handshake).collect()
    }

    #[must_use]
    pub fn outcome(&self) -> ChainOutcome {
        let Some(tail) = self.tail() else {
            return ChainOutcome::Empty;
        };
        let handshake = &tail.handshake;
        match handshake.target_stage() {
            Some(next_stage) => ChainOutcome::InProgress {
                last_stage: handshake.source_stage().clone(),
                next_stage: next_stage.clone(),
            },
            None if handshake.transition_reason() == TRANSITION_ABORTED => {
                ChainOutcome::Aborted {
                    stage: handshake.source_stage().clone(),
                }
            }
            None => ChainOutcome::Completed {
                final_stage: handshake.source_stage().clone(),
                final_outcome: tail.proof.decision_content().outcome.clone(),
                transition_reason: handshake.transition_reason().to_string(),
            },
        }
    }

    /// Sum of the `cost_usd` instrumentation attached to each decision.
    #[must_use]
    pub fn total_cost_usd(&self) -> f64 {
        self.links
            .iter()
            .filter_map(|link| link.proof.decision_content().instrumentation())
            .map(|instrumentation| instrumentation.cost_usd)
            .sum()
    }

    #[must_use]
    pub fn total_duration_ms(&self) -> u64 {
        self.links
            .iter()
            .filter_map(|link| link.proof.decision_content().instrumentation())
            .fold(0_u64, |acc, instrumentation| {
                acc.saturating_add(instrumentation.duration_ms)
            })
    }

    /// Links strictly before the first break reported for this chain.
    #[must_use]
    pub fn trusted_prefix(&self, report: &VerificationReport) -> &[ChainLink] {
        let end = report.trusted_prefix_len.min(self.links.len());
        &self.links[..end]
    }

    /// Human-readable rendering for operators.
    #[must_use]
    pub fn summary(&self, report: &VerificationReport) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Audit chain for run {}", self.run_id);
        let _ = writeln!(out, "Total cost: ${:.4}", self.total_cost_usd());
        let _ = writeln!(out, "Total duration: {} ms", self.total_duration_ms());
        let _ = writeln!(out, "Outcome: {}", describe_outcome(&self.outcome()));
        let _ = writeln!(out);
        let _ = writeln!(out, "Links:");
        for link in &self.links {
            let handshake = &link.handshake;
            let target = handshake
                .target_stage()
                .map_or("TERMINAL", StageName::as_str);
            let short_hash: String = handshake.decision_hash().chars().take(16).collect();
            let _ = writeln!(
                out,
                "  {}. {} -> {}",
                link.sequence_index + 1,
                handshake.source_stage(),
                target
            );
            let _ = writeln!(out, "     Hash: {short_hash}...");
            let _ = writeln!(out, "     Reason: {}", handshake.transition_reason());
        }
        let _ = writeln!(out);
        match report.first_break_index {
            None => {
                let _ = write!(out, "Chain integrity: VALID");
            }
            Some(index) => {
                let _ = write!(
                    out,
                    "Chain integrity: BROKEN at index {index} (trusted links: {})",
                    report.trusted_prefix_len
                );
            }
        }
        out
    }
}

fn describe_outcome(outcome: &ChainOutcome) -> String {
    match outcome {
        ChainOutcome::Empty => "empty".to_string(),
        ChainOutcome::InProgress { next_stage, .. } => format!("in progress (next: {next_stage})"),
        ChainOutcome::Completed {
            final_outcome,
            transition_reason,
            ..
        } => format!("completed ({final_outcome}, {transition_reason})"),
        ChainOutcome::Aborted { stage } => format!("aborted at {stage}"),
    }
}
