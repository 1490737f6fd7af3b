use anyhow::{Context, Result};
use audit_chain_domain::{AuditChain, ChainError, DecisionProof, Handshake, RunId};
use audit_chain_store::ChainStore;
use tracing::debug;

/// Append-only view over a store. There is no update or delete: a run ends
/// only through a terminal handshake.
pub struct AuditChainAssembler<'s, S: ChainStore + ?Sized> {
    store: &'s S,
}

impl<'s, S: ChainStore + ?Sized> AuditChainAssembler<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self { store }
    }

    /// Compare-and-append `handshake` to the run tail and return the updated chain.
    ///
    /// # Errors
    /// Returns [`ChainError::RunMismatch`], [`ChainError::OutOfOrderAppend`]
    /// or [`ChainError::RunTerminated`] inside the `anyhow` error. Nothing is
    /// stored on rejection.
    pub fn append(
        &self,
        run_id: &RunId,
        handshake: &Handshake,
        proof: &DecisionProof,
    ) -> Result<AuditChain> {
        if handshake.run_id() != run_id {
            return Err(ChainError::RunMismatch {
                run_id: run_id.to_string(),
                proof_run_id: handshake.run_id().to_string(),
            }
            .into());
        }

        let link = self.store.append_link(handshake, proof)?;
        debug!(
            run_id = %run_id,
            sequence_index = link.sequence_index,
            decision_hash = %link.handshake.decision_hash(),
            "chain link appended"
        );
        self.get(run_id)
    }

    /// # Errors
    /// Returns [`ChainError::NotFound`] when the run has no links.
    pub fn get(&self, run_id: &RunId) -> Result<AuditChain> {
        let links = self
            .store
            .load_links(run_id)
            .with_context(|| format!("failed to load chain for run {run_id}"))?;
        if links.is_empty() {
            return Err(ChainError::NotFound(run_id.to_string()).into());
        }
        Ok(AuditChain::new(run_id.clone(), links))
    }
}
