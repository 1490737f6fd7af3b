#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use audit_chain_domain::{
    ChainError, ChainLink, DecisionProof, Handshake, RunId, StageName, StoredLink,
};
use serde::{Deserialize, Serialize};

/// Current end of a run's chain.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChainTail {
    pub sequence_index: u64,
    pub decision_hash: String,
    pub terminal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub link_count: u64,
    pub last_stage: StageName,
    pub tail_decision_hash: String,
    pub terminal: bool,
}

/// Append-only persistence for chain links, keyed by `(run_id, sequence_index)`.
///
/// Implementations MUST perform [`ChainStore::append_link`] as an atomic
/// compare-and-append on the run tail using [`check_append`].
pub trait ChainStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn append_link(&self, handshake: &Handshake, proof: &DecisionProof) -> Result<ChainLink>;

    /// Links in sequence order; empty when the run is unknown.
    #[allow(clippy::missing_errors_doc)]
    fn load_links(&self, run_id: &RunId) -> Result<Vec<ChainLink>>;

    /// Links in sequence order, keeping rows that no longer decode as
    /// [`StoredLink::Undecodable`] so they can be reported by position.
    #[allow(clippy::missing_errors_doc)]
    fn load_stored_links(&self, run_id: &RunId) -> Result<Vec<StoredLink>> {
        Ok(self
            .load_links(run_id)?
            .into_iter()
            .map(StoredLink::Decoded)
            .collect())
    }

    #[allow(clippy::missing_errors_doc)]
    fn tail(&self, run_id: &RunId) -> Result<Option<ChainTail>>;

    #[allow(clippy::missing_errors_doc)]
    fn contains_decision(&self, run_id: &RunId, decision_hash: &str) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn find_decision(&self, decision_hash: &str) -> Result<Option<ChainLink>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self) -> Result<Vec<RunSummary>>;
}

/// Decide whether `handshake` may extend a run whose current tail is `tail`,
/// returning the sequence index it would occupy.
///
/// # Errors
/// Returns [`ChainError::OutOfOrderAppend`] when the parent is not the tail,
/// [`ChainError::RunTerminated`] when the parent is a terminal tail,
/// [`ChainError::RunMismatch`] when the proof belongs to another run, and
/// [`ChainError::Validation`] when the handshake and proof disagree.
pub fn check_append(
    tail: Option<&ChainTail>,
    handshake: &Handshake,
    proof: &DecisionProof,
) -> Result<u64, ChainError> {
    if handshake.run_id() != proof.run_id() {
        return Err(ChainError::RunMismatch {
            run_id: handshake.run_id().to_string(),
            proof_run_id: proof.run_id().to_string(),
        });
    }
    if handshake.decision_hash() != proof.hash() {
        return Err(ChainError::Validation(
            "handshake decision_hash MUST equal the decision proof hash".to_string(),
        ));
    }

    match tail {
        None => {
            if handshake.parent_decision_hash().is_some() {
                return Err(ChainError::OutOfOrderAppend {
                    run_id: handshake.run_id().to_string(),
                    expected_parent: None,
                    actual_parent: handshake.parent_decision_hash().map(str::to_string),
                });
            }
            Ok(0)
        }
        Some(tail) => {
            // A second root or a stale parent is out of order even on an ended run.
            if handshake.parent_decision_hash() != Some(tail.decision_hash.as_str()) {
                return Err(ChainError::OutOfOrderAppend {
                    run_id: handshake.run_id().to_string(),
                    expected_parent: Some(tail.decision_hash.clone()),
                    actual_parent: handshake.parent_decision_hash().map(str::to_string),
                });
            }
            if tail.terminal {
                return Err(ChainError::RunTerminated {
                    run_id: handshake.run_id().to_string(),
                    sequence_index: tail.sequence_index,
                });
            }
            Ok(tail.sequence_index + 1)
        }
    }
}

#[must_use]
pub fn tail_of(link: &ChainLink) -> ChainTail {
    ChainTail {
        sequence_index: link.sequence_index,
        decision_hash: link.handshake.decision_hash().to_string(),
        terminal: link.handshake.is_terminal(),
    }
}

/// Process-local store, suitable for tests and single-process embedding.
#[derive(Debug, Default)]
pub struct InMemoryChainStore {
    runs: Mutex<BTreeMap<RunId, Vec<ChainLink>>>,
}

impl InMemoryChainStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_runs<T>(
        &self,
        op: impl FnOnce(&mut BTreeMap<RunId, Vec<ChainLink>>) -> Result<T>,
    ) -> Result<T> {
        let mut runs = self
            .runs
            .lock()
            .map_err(|_| anyhow!("in-memory chain store lock poisoned"))?;
        op(&mut runs)
    }
}

impl ChainStore for InMemoryChainStore {
    fn migrate(&self) -> Result<()> {
        Ok(())
    }

    fn append_link(&self, handshake: &Handshake, proof: &DecisionProof) -> Result<ChainLink> {
        self.with_runs(|runs| {
            let tail = runs
                .get(handshake.run_id())
                .and_then(|links| links.last())
                .map(tail_of);
            let sequence_index = check_append(tail.as_ref(), handshake, proof)?;
            let link = ChainLink {
                sequence_index,
                handshake: handshake.clone(),
                proof: proof.clone(),
            };
            runs.entry(handshake.run_id().clone())
                .or_default()
                .push(link.clone());
            Ok(link)
        })
    }

    fn load_links(&self, run_id: &RunId) -> Result<Vec<ChainLink>> {
        self.with_runs(|runs| Ok(runs.get(run_id).cloned().unwrap_or_default()))
    }

    fn tail(&self, run_id: &RunId) -> Result<Option<ChainTail>> {
        self.with_runs(|runs| Ok(runs.get(run_id).and_then(|links| links.last()).map(tail_of)))
    }

    fn contains_decision(&self, run_id: &RunId, decision_hash: &str) -> Result<bool> {
        self.with_runs(|runs| {
            Ok(runs.get(run_id).is_some_and(|links| {
                links
                    .iter()
                    .any(|link| link.handshake.decision_hash() == decision_hash)
            }))
        })
    }

    fn find_decision(&self, decision_hash: &str) -> Result<Option<ChainLink>> {
        self.with_runs(|runs| {
            Ok(runs
                .values()
                .flatten()
                .find(|link| link.handshake.decision_hash() == decision_hash)
                .cloned())
        })
    }

    fn list_runs(&self) -> Result<Vec<RunSummary>> {
        self.with_runs(|runs| {
            Ok(runs
                .iter()
                .filter_map(|(run_id, links)| {
                    links.last().map(|tail| RunSummary {
                        run_id: run_id.clone(),
                        link_count: links.len() as u64,
                        last_stage: tail.handshake.source_stage().clone(),
                        tail_decision_hash: tail.handshake.decision_hash().to_string(),
                        terminal: tail.handshake.is_terminal(),
                    })
                })
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audit_chain_domain::{
        now_utc, DecisionContent, DecisionProofBuilder, HandshakeId, HandshakeParts,
    };
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_pair(
        run: &str,
        stage: &str,
        target: Option<&str>,
        parent: Option<&str>,
    ) -> (Handshake, DecisionProof) {
        let proof = must_ok(DecisionProofBuilder::create(
            stage,
            run,
            DecisionContent::new("ok", 0.7),
        ));
        let handshake = must_ok(Handshake::seal(HandshakeParts {
            handshake_id: HandshakeId::new(),
            run_id: proof.run_id().clone(),
            source_stage: proof.stage_name().clone(),
            target_stage: target.map(|name| must_ok(StageName::parse(name))),
            decision_hash: proof.hash().to_string(),
            parent_decision_hash: parent.map(str::to_string),
            transition_reason: "next".to_string(),
            metadata: BTreeMap::new(),
            created_at: now_utc(),
        }));
        (handshake, proof)
    }

    fn chain_error(result: Result<ChainLink>) -> ChainError {
        match result {
            Ok(link) => panic!("expected rejection, got link {}", link.sequence_index),
            Err(err) => match err.downcast_ref::<ChainError>() {
                Some(chain_err) => chain_err.clone(),
                None => panic!("expected ChainError, got {err:#}"),
            },
        }
    }

    #[test]
    fn second_root_is_rejected_as_out_of_order() {
        let store = InMemoryChainStore::new();
        let run = must_ok(RunId::parse("R1"));
        let (root, root_proof) = fixture_pair("R1", "discovery", Some("validation"), None);
        assert_eq!(must_ok(store.append_link(&root, &root_proof)).sequence_index, 0);

        let (again, again_proof) = fixture_pair("R1", "discovery", Some("validation"), None);
        let err = chain_error(store.append_link(&again, &again_proof));
        assert!(matches!(err, ChainError::OutOfOrderAppend { .. }), "{err}");
        assert_eq!(must_ok(store.load_links(&run)).len(), 1);
    }

    #[test]
    fn wrong_parent_is_rejected_without_mutation() {
        let store = InMemoryChainStore::new();
        let run = must_ok(RunId::parse("R1"));
        let (root, root_proof) = fixture_pair("R1", "discovery", Some("validation"), None);
        must_ok(store.append_link(&root, &root_proof));
        let before = must_ok(store.load_links(&run));

        let fabricated = "e".repeat(64);
        let (child, child_proof) =
            fixture_pair("R1", "validation", None, Some(fabricated.as_str()));
        let err = chain_error(store.append_link(&child, &child_proof));
        assert!(matches!(err, ChainError::OutOfOrderAppend { .. }), "{err}");
        assert_eq!(must_ok(store.load_links(&run)), before);
    }

    #[test]
    fn terminal_run_refuses_further_links() {
        let store = InMemoryChainStore::new();
        let (root, root_proof) = fixture_pair("R1", "discovery", None, None);
        must_ok(store.append_link(&root, &root_proof));
        let (late, late_proof) =
            fixture_pair("R1", "validation", None, Some(root.decision_hash()));
        let err = chain_error(store.append_link(&late, &late_proof));
        assert!(matches!(err, ChainError::RunTerminated { sequence_index: 0, .. }), "{err}");
    }

    #[test]
    fn second_root_on_an_ended_run_is_out_of_order() {
        let store = InMemoryChainStore::new();
        let run = must_ok(RunId::parse("R1"));
        let (root, root_proof) = fixture_pair("R1", "discovery", Some("validation"), None);
        must_ok(store.append_link(&root, &root_proof));
        let (last, last_proof) =
            fixture_pair("R1", "validation", None, Some(root.decision_hash()));
        must_ok(store.append_link(&last, &last_proof));

        let (again, again_proof) = fixture_pair("R1", "discovery", Some("validation"), None);
        let err = chain_error(store.append_link(&again, &again_proof));
        match err {
            ChainError::OutOfOrderAppend {
                expected_parent,
                actual_parent,
                ..
            } => {
                assert_eq!(expected_parent.as_deref(), Some(last.decision_hash()));
                assert_eq!(actual_parent, None);
            }
            other => panic!("expected out of order append, got {other}"),
        }

        let stale = "d".repeat(64);
        let (child, child_proof) = fixture_pair("R1", "monitoring", None, Some(stale.as_str()));
        let err = chain_error(store.append_link(&child, &child_proof));
        assert!(matches!(err, ChainError::OutOfOrderAppend { .. }), "{err}");
        assert_eq!(must_ok(store.load_links(&run)).len(), 2);
    }

    #[test]
    fn rejected_first_append_does_not_register_the_run() {
        let store = InMemoryChainStore::new();
        let parent = "a".repeat(64);
        let (child, child_proof) = fixture_pair("R9", "validation", None, Some(parent.as_str()));
        let _ = chain_error(store.append_link(&child, &child_proof));
        assert!(must_ok(store.list_runs()).is_empty());
    }

    #[test]
    fn lookups_cover_membership_tail_and_summaries() {
        let store = InMemoryChainStore::new();
        let run = must_ok(RunId::parse("R1"));
        let (root, root_proof) = fixture_pair("R1", "discovery", Some("validation"), None);
        must_ok(store.append_link(&root, &root_proof));
        let (child, child_proof) =
            fixture_pair("R1", "validation", None, Some(root.decision_hash()));
        must_ok(store.append_link(&child, &child_proof));

        assert!(must_ok(store.contains_decision(&run, root.decision_hash())));
        assert!(!must_ok(store.contains_decision(&run, "missing")));
        let tail = must_ok(store.tail(&run));
        assert_eq!(
            tail,
            Some(ChainTail {
                sequence_index: 1,
                decision_hash: child.decision_hash().to_string(),
                terminal: true,
            })
        );
        let found = must_ok(store.find_decision(child.decision_hash()));
        assert_eq!(found.map(|link| link.sequence_index), Some(1));

        let runs = must_ok(store.list_runs());
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].link_count, 2);
        assert!(runs[0].terminal);
    }

    #[test]
    fn racing_appends_on_the_same_tail_admit_exactly_one() {
        let store = Arc::new(InMemoryChainStore::new());
        let (root, root_proof) = fixture_pair("R1", "discovery", Some("validation"), None);
        must_ok(store.append_link(&root, &root_proof));
        let parent = root.decision_hash().to_string();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let (child, child_proof) =
                    fixture_pair("R1", "validation", Some("monitoring"), Some(parent.as_str()));
                std::thread::spawn(move || store.append_link(&child, &child_proof).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or(false))
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(must_ok(store.load_links(&must_ok(RunId::parse("R1")))).len(), 2);
    }
}
