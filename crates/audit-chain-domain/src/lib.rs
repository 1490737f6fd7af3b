#![forbid(unsafe_code)]

//! Value objects and pure functions for the decision audit chain.
//!
//! Everything in this crate is storage-agnostic: proofs and handshakes are
//! immutable once sealed, and [`verify_chain`] only reads.

pub mod canonical;
mod chain;
mod handshake;
mod proof;
mod verify;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub use chain::{AuditChain, ChainLink, ChainOutcome, StoredLink};
pub use handshake::{recompute_handshake_hash, Handshake, HandshakeParts};
pub use proof::{
    recompute_hash, DecisionContent, DecisionProof, DecisionProofBuilder, DecisionStamp,
    Instrumentation, INSTRUMENTATION_KEY,
};
pub use verify::{verify_chain, verify_stored, BreakKind, ChainBreak, VerificationReport};

pub type DateTimeUtc = OffsetDateTime;

/// Transition reason recorded on the terminal handshake of a cancelled run.
pub const TRANSITION_ABORTED: &str = "ABORTED";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChainError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error(
        "orphan handshake: parent decision {parent_decision_hash} is not recorded in run {run_id}"
    )]
    OrphanHandshake {
        run_id: String,
        parent_decision_hash: String,
    },
    #[error("run mismatch: decision belongs to run {proof_run_id}, handshake targets run {run_id}")]
    RunMismatch { run_id: String, proof_run_id: String },
    #[error(
        "out of order append for run {run_id}: expected parent {}, got {}",
        display_hash(.expected_parent.as_deref()),
        display_hash(.actual_parent.as_deref())
    )]
    OutOfOrderAppend {
        run_id: String,
        expected_parent: Option<String>,
        actual_parent: Option<String>,
    },
    #[error("run {run_id} already ended with a terminal handshake at sequence {sequence_index}")]
    RunTerminated { run_id: String, sequence_index: u64 },
    #[error("run not found: {0}")]
    NotFound(String),
    #[error("chain integrity error in run {run_id}: first break at index {first_break_index}")]
    ChainIntegrity {
        run_id: String,
        first_break_index: usize,
        reasons: Vec<String>,
    },
}

impl ChainError {
    /// Stable machine-readable code used by the HTTP and CLI surfaces.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Encoding(_) => "encoding_error",
            Self::OrphanHandshake { .. } => "orphan_handshake",
            Self::RunMismatch { .. } => "run_mismatch",
            Self::OutOfOrderAppend { .. } => "out_of_order_append",
            Self::RunTerminated { .. } => "run_terminated",
            Self::NotFound(_) => "not_found",
            Self::ChainIntegrity { .. } => "chain_integrity",
        }
    }
}

fn display_hash(value: Option<&str>) -> &str {
    value.unwrap_or("<root>")
}

/// Caller-supplied identifier of one processing run.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// # Errors
    /// Returns [`ChainError::Validation`] when the identifier is blank.
    pub fn parse(value: impl Into<String>) -> Result<Self, ChainError> {
        let value = value.into();
        ensure_non_empty("run_id", &value)?;
        Ok(Self(value.trim().to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Strict: a deserialized identifier must already be in canonical form.
impl TryFrom<String> for RunId {
    type Error = ChainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let parsed = Self::parse(value.as_str())?;
        if parsed.0 != value {
            return Err(ChainError::Validation(format!(
                "run_id {value:?} MUST be trimmed"
            )));
        }
        Ok(parsed)
    }
}

impl From<RunId> for String {
    fn from(value: RunId) -> Self {
        value.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pipeline stage name, normalized to trimmed lowercase.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct StageName(String);

impl StageName {
    pub const DISCOVERY: &'static str = "discovery";
    pub const VALIDATION: &'static str = "validation";
    pub const MONITORING: &'static str = "monitoring";
    pub const REMEDIATION: &'static str = "remediation";

    /// # Errors
    /// Returns [`ChainError::Validation`] when the name is blank.
    pub fn parse(value: impl AsRef<str>) -> Result<Self, ChainError> {
        let value = value.as_ref();
        ensure_non_empty("stage_name", value)?;
        Ok(Self(value.trim().to_ascii_lowercase()))
    }

    #[must_use]
    pub fn discovery() -> Self {
        Self(Self::DISCOVERY.to_string())
    }

    #[must_use]
    pub fn validation() -> Self {
        Self(Self::VALIDATION.to_string())
    }

    #[must_use]
    pub fn monitoring() -> Self {
        Self(Self::MONITORING.to_string())
    }

    #[must_use]
    pub fn remediation() -> Self {
        Self(Self::REMEDIATION.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StageName {
    type Error = ChainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let parsed = Self::parse(value.as_str())?;
        if parsed.0 != value {
            return Err(ChainError::Validation(format!(
                "stage_name {value:?} MUST be trimmed lowercase"
            )));
        }
        Ok(parsed)
    }
}

impl From<StageName> for String {
    fn from(value: StageName) -> Self {
        value.0
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DecisionId(pub Ulid);

impl DecisionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for DecisionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DecisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HandshakeId(pub Ulid);

impl HandshakeId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for HandshakeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HandshakeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns [`ChainError::Validation`] when the value is empty or whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), ChainError> {
    if value.trim().is_empty() {
        return Err(ChainError::Validation(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    Ok(())
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ChainError::Encoding`] if the timestamp cannot be formatted.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String, ChainError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| ChainError::Encoding(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Parses an RFC3339 timestamp that MUST carry the UTC offset.
///
/// # Errors
/// Returns [`ChainError::Validation`] for malformed or non-UTC timestamps.
pub fn parse_rfc3339_utc(value: &str) -> Result<DateTimeUtc, ChainError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ChainError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ChainError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}
