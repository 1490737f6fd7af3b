use serde::{Deserialize, Serialize};

use crate::{
    recompute_handshake_hash, recompute_hash, AuditChain, ChainError, ChainLink, RunId, StoredLink,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    RootHasParent,
    ParentMismatch,
    ContentTamper,
    StoredHashMismatch,
    HandshakeTamper,
    RunMismatch,
    StageMismatch,
    SequenceGap,
    AfterTerminal,
    Unencodable,
}

impl BreakKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RootHasParent => "root_has_parent",
            Self::ParentMismatch => "parent_mismatch",
            Self::ContentTamper => "content_tamper",
            Self::StoredHashMismatch => "stored_hash_mismatch",
            Self::HandshakeTamper => "handshake_tamper",
            Self::RunMismatch => "run_mismatch",
            Self::StageMismatch => "stage_mismatch",
            Self::SequenceGap => "sequence_gap",
            Self::AfterTerminal => "after_terminal",
            Self::Unencodable => "unencodable",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChainBreak {
    pub index: usize,
    pub kind: BreakKind,
    pub detail: String,
}

/// Outcome of replaying a chain. Contains no timestamps so repeated
/// verification of unchanged data serializes byte-for-byte identically.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VerificationReport {
    pub run_id: RunId,
    pub valid: bool,
    pub links_checked: usize,
    pub first_break_index: Option<usize>,
    /// Number of leading links that remain trustworthy.
    pub trusted_prefix_len: usize,
    pub breaks: Vec<ChainBreak>,
    pub reasons: Vec<String>,
}

impl VerificationReport {
    /// # Errors
    /// Returns [`ChainError::ChainIntegrity`] when any break was found.
    pub fn ensure_trusted(&self) -> Result<(), ChainError> {
        match self.first_break_index {
            None => Ok(()),
            Some(first_break_index) => Err(ChainError::ChainIntegrity {
                run_id: self.run_id.to_string(),
                first_break_index,
                reasons: self.reasons.clone(),
            }),
        }
    }
}

/// Replay a chain and report every linkage or content break.
#[must_use]
pub fn verify_chain(chain: &AuditChain) -> VerificationReport {
    replay(chain.run_id(), chain.links().iter().map(Entry::Link))
}

/// Replay links as read from storage. An undecodable row is reported as an
/// [`BreakKind::Unencodable`] break at its position; the links before it stay
/// trusted.
#[must_use]
pub fn verify_stored(run_id: &RunId, links: &[StoredLink]) -> VerificationReport {
    replay(
        run_id,
        links.iter().map(|stored| match stored {
            StoredLink::Decoded(link) => Entry::Link(link),
            StoredLink::Undecodable {
                sequence_index,
                detail,
            } => Entry::Undecodable {
                sequence_index: *sequence_index,
                detail,
            },
        }),
    )
}

enum Entry<'a> {
    Link(&'a ChainLink),
    Undecodable { sequence_index: u64, detail: &'a str },
}

/// What precedes the link being checked.
#[derive(Clone, Copy)]
enum Previous<'a> {
    Root,
    Link(&'a ChainLink),
    Unreadable,
}

fn replay<'a>(run_id: &RunId, entries: impl Iterator<Item = Entry<'a>>) -> VerificationReport {
    let mut breaks = Vec::new();
    let mut previous = Previous::Root;
    let mut links_checked = 0;

    for (index, entry) in entries.enumerate() {
        links_checked += 1;
        match entry {
            Entry::Link(link) => {
                check_link(run_id, index, link, previous, &mut breaks);
                previous = Previous::Link(link);
            }
            Entry::Undecodable {
                sequence_index,
                detail,
            } => {
                check_sequence(index, sequence_index, &mut breaks);
                breaks.push(ChainBreak {
                    index,
                    kind: BreakKind::Unencodable,
                    detail: format!("stored link does not decode: {detail}"),
                });
                previous = Previous::Unreadable;
            }
        }
    }

    let first_break_index = breaks.iter().map(|found| found.index).min();
    let reasons = breaks
        .iter()
        .map(|found| format!("index {}: {}: {}", found.index, found.kind.as_str(), found.detail))
        .collect();

    VerificationReport {
        run_id: run_id.clone(),
        valid: breaks.is_empty(),
        links_checked,
        first_break_index,
        trusted_prefix_len: first_break_index.unwrap_or(links_checked),
        breaks,
        reasons,
    }
}

fn check_sequence(index: usize, sequence_index: u64, breaks: &mut Vec<ChainBreak>) {
    if usize::try_from(sequence_index).ok() != Some(index) {
        breaks.push(ChainBreak {
            index,
            kind: BreakKind::SequenceGap,
            detail: format!("stored sequence_index {sequence_index} at position {index}"),
        });
    }
}

fn check_link(
    run_id: &RunId,
    index: usize,
    link: &ChainLink,
    previous: Previous<'_>,
    breaks: &mut Vec<ChainBreak>,
) {
    check_sequence(index, link.sequence_index, breaks);

    let mut record = |kind: BreakKind, detail: String| {
        breaks.push(ChainBreak {
            index,
            kind,
            detail,
        });
    };
    let handshake = &link.handshake;

    if handshake.run_id() != run_id || link.proof.run_id() != run_id {
        record(
            BreakKind::RunMismatch,
            format!(
                "handshake run {} and decision run {} differ from chain run {run_id}",
                handshake.run_id(),
                link.proof.run_id()
            ),
        );
    }

    if handshake.source_stage() != link.proof.stage_name() {
        record(
            BreakKind::StageMismatch,
            format!(
                "handshake source_stage {} differs from decision stage {}",
                handshake.source_stage(),
                link.proof.stage_name()
            ),
        );
    }

    match previous {
        Previous::Root => {
            if let Some(parent) = handshake.parent_decision_hash() {
                record(
                    BreakKind::RootHasParent,
                    format!("root handshake references parent {parent}"),
                );
            }
        }
        Previous::Link(previous) => {
            let expected = previous.handshake.decision_hash();
            if handshake.parent_decision_hash() != Some(expected) {
                record(
                    BreakKind::ParentMismatch,
                    format!(
                        "parent {} does not match previous decision {expected}",
                        handshake.parent_decision_hash().unwrap_or("<none>")
                    ),
                );
            }
            if previous.handshake.is_terminal() {
                record(
                    BreakKind::AfterTerminal,
                    "link follows a terminal handshake".to_string(),
                );
            }
        }
        // Linkage to an unreadable row cannot be checked; that row is already a break.
        Previous::Unreadable => {}
    }

    match recompute_hash(&link.proof) {
        Ok(recomputed) => {
            if recomputed != handshake.decision_hash() {
                record(
                    BreakKind::ContentTamper,
                    format!(
                        "recomputed decision hash {recomputed} differs from handshake decision_hash {}",
                        handshake.decision_hash()
                    ),
                );
            }
            if recomputed != link.proof.hash() {
                record(
                    BreakKind::StoredHashMismatch,
                    format!(
                        "recomputed decision hash {recomputed} differs from stored proof hash {}",
                        link.proof.hash()
                    ),
                );
            }
        }
        Err(err) => record(BreakKind::Unencodable, format!("decision proof: {err}")),
    }

    match recompute_handshake_hash(handshake) {
        Ok(recomputed) if recomputed != handshake.handshake_hash() => record(
            BreakKind::HandshakeTamper,
            format!(
                "recomputed handshake hash {recomputed} differs from stored {}",
                handshake.handshake_hash()
            ),
        ),
        Ok(_) => {}
        Err(err) => record(BreakKind::Unencodable, format!("handshake: {err}")),
    }
}
