use std::collections::BTreeMap;

use anyhow::Result;
use audit_chain_domain::{
    now_utc, ChainError, DecisionProof, Handshake, HandshakeId, HandshakeParts, RunId, StageName,
};
use audit_chain_store::ChainStore;
use serde_json::Value;

/// Routing fields supplied by the stage that produced a decision.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeDraft {
    pub source_stage: StageName,
    pub target_stage: Option<StageName>,
    pub parent_decision_hash: Option<String>,
    pub transition_reason: String,
    pub metadata: BTreeMap<String, Value>,
}

/// Wraps decision proofs into handshakes after checking them against the
/// run's recorded decisions.
pub struct HandshakeEmitter<'s, S: ChainStore + ?Sized> {
    store: &'s S,
}

impl<'s, S: ChainStore + ?Sized> HandshakeEmitter<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self { store }
    }

    /// # Errors
    /// Returns [`ChainError::RunMismatch`], [`ChainError::Validation`] or
    /// [`ChainError::OrphanHandshake`] inside the `anyhow` error, or a store
    /// error if the parent lookup fails.
    pub fn emit(
        &self,
        run_id: &RunId,
        proof: &DecisionProof,
        draft: HandshakeDraft,
    ) -> Result<Handshake> {
        if proof.run_id() != run_id {
            return Err(ChainError::RunMismatch {
                run_id: run_id.to_string(),
                proof_run_id: proof.run_id().to_string(),
            }
            .into());
        }

        if &draft.source_stage != proof.stage_name() {
            return Err(ChainError::Validation(format!(
                "source_stage {} MUST match the decision's stage {}",
                draft.source_stage,
                proof.stage_name()
            ))
            .into());
        }

        if let Some(parent) = draft.parent_decision_hash.as_deref() {
            if !self.store.contains_decision(run_id, parent)? {
                return Err(ChainError::OrphanHandshake {
                    run_id: run_id.to_string(),
                    parent_decision_hash: parent.to_string(),
                }
                .into());
            }
        }

        let handshake = Handshake::seal(HandshakeParts {
            handshake_id: HandshakeId::new(),
            run_id: run_id.clone(),
            source_stage: draft.source_stage,
            target_stage: draft.target_stage,
            decision_hash: proof.hash().to_string(),
            parent_decision_hash: draft.parent_decision_hash,
            transition_reason: draft.transition_reason,
            metadata: draft.metadata,
            created_at: now_utc(),
        })?;
        Ok(handshake)
    }
}
