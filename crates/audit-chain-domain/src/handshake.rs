use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::digest_fields;
use crate::{
    ensure_non_empty, format_rfc3339, ChainError, DateTimeUtc, HandshakeId, RunId, StageName,
};

/// Unsealed handshake fields. [`Handshake::seal`] validates them and computes
/// the handshake hash.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeParts {
    pub handshake_id: HandshakeId,
    pub run_id: RunId,
    pub source_stage: StageName,
    pub target_stage: Option<StageName>,
    pub decision_hash: String,
    pub parent_decision_hash: Option<String>,
    pub transition_reason: String,
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTimeUtc,
}

/// Routing envelope linking one decision to its predecessor in the same run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Handshake {
    handshake_id: HandshakeId,
    run_id: RunId,
    source_stage: StageName,
    target_stage: Option<StageName>,
    decision_hash: String,
    parent_decision_hash: Option<String>,
    transition_reason: String,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
    #[serde(with = "time::serde::rfc3339")]
    created_at: DateTimeUtc,
    handshake_hash: String,
}

impl Handshake {
    /// # Errors
    /// Returns [`ChainError::Validation`] for blank hashes or reasons and
    /// [`ChainError::Encoding`] if metadata cannot be encoded.
    pub fn seal(parts: HandshakeParts) -> Result<Self, ChainError> {
        ensure_non_empty("decision_hash", &parts.decision_hash)?;
        ensure_non_empty("transition_reason", &parts.transition_reason)?;
        if let Some(parent) = parts.parent_decision_hash.as_deref() {
            ensure_non_empty("parent_decision_hash", parent)?;
        }

        let mut handshake = Self {
            handshake_id: parts.handshake_id,
            run_id: parts.run_id,
            source_stage: parts.source_stage,
            target_stage: parts.target_stage,
            decision_hash: parts.decision_hash,
            parent_decision_hash: parts.parent_decision_hash,
            transition_reason: parts.transition_reason.trim().to_string(),
            metadata: parts.metadata,
            created_at: parts.created_at.to_offset(time::UtcOffset::UTC),
            handshake_hash: String::new(),
        };
        handshake.handshake_hash = recompute_handshake_hash(&handshake)?;
        Ok(handshake)
    }

    #[must_use]
    pub fn handshake_id(&self) -> HandshakeId {
        self.handshake_id
    }

    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    #[must_use]
    pub fn source_stage(&self) -> &StageName {
        &self.source_stage
    }

    #[must_use]
    pub fn target_stage(&self) -> Option<&StageName> {
        self.target_stage.as_ref()
    }

    #[must_use]
    pub fn decision_hash(&self) -> &str {
        &self.decision_hash
    }

    #[must_use]
    pub fn parent_decision_hash(&self) -> Option<&str> {
        self.parent_decision_hash.as_deref()
    }

    #[must_use]
    pub fn transition_reason(&self) -> &str {
        &self.transition_reason
    }

    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    #[must_use]
    pub fn created_at(&self) -> DateTimeUtc {
        self.created_at
    }

    #[must_use]
    pub fn handshake_hash(&self) -> &str {
        &self.handshake_hash
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_decision_hash.is_none()
    }

    /// A terminal handshake ends its run; nothing may be appended after it.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.target_stage.is_none()
    }
}

/// Recompute the digest over every routing field of a handshake.
///
/// # Errors
/// Returns [`ChainError::Encoding`] if a field cannot be encoded.
pub fn recompute_handshake_hash(handshake: &Handshake) -> Result<String, ChainError> {
    let optional = |value: Option<String>| value.map_or(Value::Null, Value::String);

    let mut fields = BTreeMap::new();
    fields.insert(
        "created_at".to_string(),
        Value::String(format_rfc3339(handshake.created_at)?),
    );
    fields.insert(
        "decision_hash".to_string(),
        Value::String(handshake.decision_hash.clone()),
    );
    fields.insert(
        "handshake_id".to_string(),
        Value::String(handshake.handshake_id.to_string()),
    );
    fields.insert(
        "metadata".to_string(),
        Value::Object(handshake.metadata.clone().into_iter().collect()),
    );
    fields.insert(
        "parent_decision_hash".to_string(),
        optional(handshake.parent_decision_hash.clone()),
    );
    fields.insert(
        "run_id".to_string(),
        Value::String(handshake.run_id.to_string()),
    );
    fields.insert(
        "source_stage".to_string(),
        Value::String(handshake.source_stage.to_string()),
    );
    fields.insert(
        "target_stage".to_string(),
        optional(handshake.target_stage.as_ref().map(ToString::to_string)),
    );
    fields.insert(
        "transition_reason".to_string(),
        Value::String(handshake.transition_reason.clone()),
    );
    digest_fields(&fields)
}
