#![forbid(unsafe_code)]

//! Recording side of the audit chain: turns stage decisions into proofs,
//! wraps them in handshakes and appends them to a [`ChainStore`].

mod assembler;
mod emitter;
mod fallback;
pub mod pipeline;

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use audit_chain_domain::{
    verify_stored, AuditChain, ChainError, ChainLink, DecisionContent, DecisionId,
    DecisionProofBuilder, HandshakeId, RunId, StageName, VerificationReport, TRANSITION_ABORTED,
};
use audit_chain_store::{ChainStore, RunSummary};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{info, warn};

pub use assembler::AuditChainAssembler;
pub use emitter::{HandshakeDraft, HandshakeEmitter};
pub use fallback::{
    fallback_content, resolve_with_fallback, FALLBACK_CONFIDENCE_FACTOR, FALLBACK_KEY,
};
pub use pipeline::{transition, StageResult, Transition, ValidationStatus};

/// One stage decision plus the routing that follows it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RecordRequest {
    pub run_id: String,
    pub source_stage: String,
    #[serde(default)]
    pub target_stage: Option<String>,
    #[serde(default)]
    pub parent_decision_hash: Option<String>,
    pub decision_content: DecisionContent,
    pub transition_reason: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// `decision_id` and `created_at` are the decision's stamp, so a client can
/// recompute `decision_hash` from what it sent plus this receipt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordReceipt {
    pub run_id: RunId,
    pub decision_id: DecisionId,
    pub handshake_id: HandshakeId,
    pub decision_hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub sequence_index: u64,
}

/// Facade over a [`ChainStore`] used by the service and the CLI.
pub struct AuditLedger<S: ChainStore> {
    store: S,
}

impl<S: ChainStore> AuditLedger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Build the decision proof, emit its handshake and append both.
    ///
    /// # Errors
    /// Returns a [`ChainError`] inside the `anyhow` error when the request is
    /// invalid or the append is rejected, or a store error.
    pub fn record(&self, request: RecordRequest) -> Result<RecordReceipt> {
        let run_id = RunId::parse(request.run_id)?;
        let source_stage = StageName::parse(&request.source_stage)?;
        let target_stage = request
            .target_stage
            .as_deref()
            .map(StageName::parse)
            .transpose()?;

        let proof = DecisionProofBuilder::create(
            source_stage.as_str(),
            run_id.as_str(),
            request.decision_content,
        )?;
        let handshake = HandshakeEmitter::new(&self.store).emit(
            &run_id,
            &proof,
            HandshakeDraft {
                source_stage,
                target_stage,
                parent_decision_hash: request.parent_decision_hash,
                transition_reason: request.transition_reason,
                metadata: request.metadata,
            },
        )?;

        let chain = AuditChainAssembler::new(&self.store).append(&run_id, &handshake, &proof)?;
        let sequence_index = chain
            .links()
            .iter()
            .find(|link| link.handshake.handshake_id() == handshake.handshake_id())
            .map(|link| link.sequence_index)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "appended handshake {} missing from run {run_id}",
                    handshake.handshake_id()
                )
            })?;

        info!(
            run_id = %run_id,
            stage = %handshake.source_stage(),
            decision_hash = %handshake.decision_hash(),
            sequence_index,
            terminal = handshake.is_terminal(),
            "decision recorded"
        );

        Ok(RecordReceipt {
            run_id,
            decision_id: proof.decision_id(),
            handshake_id: handshake.handshake_id(),
            decision_hash: handshake.decision_hash().to_string(),
            created_at: proof.created_at(),
            sequence_index,
        })
    }

    /// Record a stage result, routing it with [`transition`].
    ///
    /// # Errors
    /// Same as [`AuditLedger::record`].
    pub fn record_stage(
        &self,
        run_id: &RunId,
        result: &StageResult,
        content: DecisionContent,
        parent_decision_hash: Option<String>,
    ) -> Result<RecordReceipt> {
        let routed = transition(result);
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "stage_result".to_string(),
            serde_json::to_value(result).context("failed to serialize stage result")?,
        );

        self.record(RecordRequest {
            run_id: run_id.to_string(),
            source_stage: routed.source_stage.to_string(),
            target_stage: routed.target_stage.map(String::from),
            parent_decision_hash,
            decision_content: content,
            transition_reason: routed.reason,
            metadata,
        })
    }

    /// End a run early with a terminal `ABORTED` handshake chained to the tail.
    ///
    /// # Errors
    /// Returns [`ChainError::NotFound`] for an unknown run and
    /// [`ChainError::RunTerminated`] when the run already ended.
    pub fn abort(
        &self,
        run_id: &RunId,
        stage: &StageName,
        detail: &str,
    ) -> Result<RecordReceipt> {
        let tail = self
            .store
            .tail(run_id)?
            .ok_or_else(|| ChainError::NotFound(run_id.to_string()))?;
        if tail.terminal {
            return Err(ChainError::RunTerminated {
                run_id: run_id.to_string(),
                sequence_index: tail.sequence_index,
            }
            .into());
        }

        warn!(run_id = %run_id, stage = %stage, detail, "aborting run");
        let mut metadata = BTreeMap::new();
        metadata.insert("abort_detail".to_string(), Value::String(detail.to_string()));

        self.record(RecordRequest {
            run_id: run_id.to_string(),
            source_stage: stage.to_string(),
            target_stage: None,
            parent_decision_hash: Some(tail.decision_hash),
            decision_content: DecisionContent::new("aborted", 0.0)
                .with_metadata("detail", Value::String(detail.to_string())),
            transition_reason: TRANSITION_ABORTED.to_string(),
            metadata,
        })
    }

    /// # Errors
    /// Returns [`ChainError::NotFound`] when the run has no links.
    pub fn chain(&self, run_id: &RunId) -> Result<AuditChain> {
        AuditChainAssembler::new(&self.store).get(run_id)
    }

    /// Replay the stored run. Rows that no longer decode are reported as
    /// breaks rather than failing the call.
    ///
    /// # Errors
    /// Returns [`ChainError::NotFound`] when the run has no links.
    pub fn verify(&self, run_id: &RunId) -> Result<VerificationReport> {
        let stored = self
            .store
            .load_stored_links(run_id)
            .with_context(|| format!("failed to load chain for run {run_id}"))?;
        if stored.is_empty() {
            return Err(ChainError::NotFound(run_id.to_string()).into());
        }
        let report = verify_stored(run_id, &stored);
        if !report.valid {
            warn!(
                run_id = %run_id,
                first_break_index = ?report.first_break_index,
                "chain verification failed"
            );
        }
        Ok(report)
    }

    /// # Errors
    /// Returns an error if the store cannot be read.
    pub fn runs(&self) -> Result<Vec<RunSummary>> {
        self.store.list_runs()
    }

    /// # Errors
    /// Returns [`ChainError::NotFound`] when no run recorded the decision.
    pub fn find_decision(&self, decision_hash: &str) -> Result<ChainLink> {
        self.store
            .find_decision(decision_hash)?
            .ok_or_else(|| ChainError::NotFound(decision_hash.to_string()).into())
    }
}
