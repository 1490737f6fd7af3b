use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::digest_fields;
use crate::{
    ensure_non_empty, format_rfc3339, now_utc, ChainError, DateTimeUtc, DecisionId, RunId,
    StageName,
};

/// Metadata key under which [`Instrumentation`] is attached to a decision.
pub const INSTRUMENTATION_KEY: &str = "instrumentation";

/// Logical payload of one stage decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DecisionContent {
    pub outcome: String,
    pub confidence: f64,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl DecisionContent {
    #[must_use]
    pub fn new(outcome: impl Into<String>, confidence: f64) -> Self {
        Self {
            outcome: outcome.into(),
            confidence,
            citations: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_citation(mut self, citation: impl Into<String>) -> Self {
        self.citations.push(citation.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Attach cost and timing explicitly so they become part of the hashed content.
    ///
    /// # Errors
    /// Returns [`ChainError::Validation`] for negative or non-finite cost, or
    /// [`ChainError::Encoding`] if the value cannot be serialized.
    pub fn with_instrumentation(
        mut self,
        instrumentation: &Instrumentation,
    ) -> Result<Self, ChainError> {
        instrumentation.validate()?;
        let value = serde_json::to_value(instrumentation)
            .map_err(|err| ChainError::Encoding(format!("instrumentation: {err}")))?;
        self.metadata.insert(INSTRUMENTATION_KEY.to_string(), value);
        Ok(self)
    }

    #[must_use]
    pub fn instrumentation(&self) -> Option<Instrumentation> {
        self.metadata
            .get(INSTRUMENTATION_KEY)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// # Errors
    /// Returns [`ChainError::Validation`] when a required field is missing or
    /// out of range.
    pub fn validate(&self) -> Result<(), ChainError> {
        ensure_non_empty("decision_content.outcome", &self.outcome)?;

        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(ChainError::Validation(format!(
                "decision_content.confidence MUST be within [0, 1], got {}",
                self.confidence
            )));
        }

        for (index, citation) in self.citations.iter().enumerate() {
            ensure_non_empty(&format!("decision_content.citations[{index}]"), citation)?;
        }

        Ok(())
    }
}

/// Explicit per-decision cost and timing, supplied by the calling stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Instrumentation {
    pub cost_usd: f64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

impl Instrumentation {
    /// # Errors
    /// Returns [`ChainError::Validation`] when `cost_usd` is negative or not finite.
    pub fn validate(&self) -> Result<(), ChainError> {
        if !self.cost_usd.is_finite() || self.cost_usd < 0.0 {
            return Err(ChainError::Validation(format!(
                "instrumentation.cost_usd MUST be a finite non-negative amount, got {}",
                self.cost_usd
            )));
        }
        Ok(())
    }
}

/// Identity and time assigned to a decision at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionStamp {
    pub decision_id: DecisionId,
    pub created_at: DateTimeUtc,
}

impl DecisionStamp {
    #[must_use]
    pub fn now() -> Self {
        Self {
            decision_id: DecisionId::new(),
            created_at: now_utc(),
        }
    }
}

/// Immutable, hashed record of one stage's decision within one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionProof {
    decision_id: DecisionId,
    stage_name: StageName,
    run_id: RunId,
    #[serde(with = "time::serde::rfc3339")]
    created_at: DateTimeUtc,
    decision_content: DecisionContent,
    hash: String,
}

impl DecisionProof {
    #[must_use]
    pub fn decision_id(&self) -> DecisionId {
        self.decision_id
    }

    #[must_use]
    pub fn stage_name(&self) -> &StageName {
        &self.stage_name
    }

    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTimeUtc {
        self.created_at
    }

    #[must_use]
    pub fn decision_content(&self) -> &DecisionContent {
        &self.decision_content
    }

    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// True when the stored hash still matches the stored fields.
    #[must_use]
    pub fn verify_hash(&self) -> bool {
        recompute_hash(self).is_ok_and(|hash| hash == self.hash)
    }

    fn hash_material(&self) -> Result<BTreeMap<String, Value>, ChainError> {
        let content = serde_json::to_value(&self.decision_content)
            .map_err(|err| ChainError::Encoding(format!("decision_content: {err}")))?;

        let mut fields = BTreeMap::new();
        fields.insert(
            "created_at".to_string(),
            Value::String(format_rfc3339(self.created_at)?),
        );
        fields.insert("decision_content".to_string(), content);
        fields.insert(
            "decision_id".to_string(),
            Value::String(self.decision_id.to_string()),
        );
        fields.insert(
            "run_id".to_string(),
            Value::String(self.run_id.to_string()),
        );
        fields.insert(
            "stage_name".to_string(),
            Value::String(self.stage_name.to_string()),
        );
        Ok(fields)
    }
}

/// Recompute a proof's digest from its stored fields.
///
/// # Errors
/// Returns [`ChainError::Encoding`] if the stored content cannot be encoded.
pub fn recompute_hash(proof: &DecisionProof) -> Result<String, ChainError> {
    digest_fields(&proof.hash_material()?)
}

/// Stateless factory for [`DecisionProof`] values.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionProofBuilder;

impl DecisionProofBuilder {
    /// Create a proof stamped with a fresh id and the current UTC time.
    ///
    /// # Errors
    /// Returns [`ChainError::Validation`] for invalid input and
    /// [`ChainError::Encoding`] if the content cannot be hashed.
    pub fn create(
        stage_name: &str,
        run_id: &str,
        decision_content: DecisionContent,
    ) -> Result<DecisionProof, ChainError> {
        Self::create_with(DecisionStamp::now(), stage_name, run_id, decision_content)
    }

    /// Create a proof with an explicit id and timestamp.
    ///
    /// # Errors
    /// Same as [`DecisionProofBuilder::create`].
    pub fn create_with(
        stamp: DecisionStamp,
        stage_name: &str,
        run_id: &str,
        decision_content: DecisionContent,
    ) -> Result<DecisionProof, ChainError> {
        let stage_name = StageName::parse(stage_name)?;
        let run_id = RunId::parse(run_id)?;
        decision_content.validate()?;

        let mut proof = DecisionProof {
            decision_id: stamp.decision_id,
            stage_name,
            run_id,
            created_at: stamp.created_at.to_offset(time::UtcOffset::UTC),
            decision_content,
            hash: String::new(),
        };
        proof.hash = recompute_hash(&proof)?;
        Ok(proof)
    }
}
