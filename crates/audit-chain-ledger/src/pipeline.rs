//! Stage outcomes and the routing rule between stages.

use audit_chain_domain::StageName;
use serde::{Deserialize, Serialize};

pub mod reasons {
    pub const LEADS_DISCOVERED: &str = "leads_discovered";
    pub const NO_LEADS: &str = "no_leads";
    pub const COMPLIANCE_APPROVED: &str = "compliance_approved";
    pub const DEFICIENCY_FOUND: &str = "deficiency_found";
    pub const COMPLIANCE_FAILED: &str = "compliance_failed";
    pub const MANUAL_REVIEW_REQUIRED: &str = "manual_review_required";
    pub const VIOLATION_DETECTED: &str = "violation_detected";
    pub const MONITORING_CLEAR: &str = "monitoring_clear";
    pub const REMEDIATION_COMPLETE: &str = "remediation_complete";
    pub const REMEDIATION_INCOMPLETE: &str = "remediation_incomplete";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Approved,
    PendingFix,
    Rejected,
    Illegible,
}

/// What a stage concluded, one variant per stage kind.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageResult {
    Discovery { leads_found: u32 },
    Validation { status: ValidationStatus },
    Monitoring { violations: u32 },
    Remediation { resolved: bool },
}

impl StageResult {
    #[must_use]
    pub fn stage(&self) -> StageName {
        match self {
            Self::Discovery { .. } => StageName::discovery(),
            Self::Validation { .. } => StageName::validation(),
            Self::Monitoring { .. } => StageName::monitoring(),
            Self::Remediation { .. } => StageName::remediation(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Transition {
    pub source_stage: StageName,
    /// `None` ends the run.
    pub target_stage: Option<StageName>,
    pub reason: String,
}

/// Route a stage result to exactly one next stage, or to the end of the run.
#[must_use]
pub fn transition(result: &StageResult) -> Transition {
    let (target_stage, reason) = match result {
        StageResult::Discovery { leads_found: 0 } => (None, reasons::NO_LEADS),
        StageResult::Discovery { .. } => (Some(StageName::validation()), reasons::LEADS_DISCOVERED),
        StageResult::Validation { status } => match status {
            ValidationStatus::Approved => {
                (Some(StageName::monitoring()), reasons::COMPLIANCE_APPROVED)
            }
            ValidationStatus::PendingFix => {
                (Some(StageName::remediation()), reasons::DEFICIENCY_FOUND)
            }
            ValidationStatus::Rejected => (None, reasons::COMPLIANCE_FAILED),
            ValidationStatus::Illegible => (None, reasons::MANUAL_REVIEW_REQUIRED),
        },
        StageResult::Monitoring { violations: 0 } => (None, reasons::MONITORING_CLEAR),
        StageResult::Monitoring { .. } => {
            (Some(StageName::remediation()), reasons::VIOLATION_DETECTED)
        }
        StageResult::Remediation { resolved: true } => (None, reasons::REMEDIATION_COMPLETE),
        StageResult::Remediation { resolved: false } => (None, reasons::REMEDIATION_INCOMPLETE),
    };

    Transition {
        source_stage: result.stage(),
        target_stage,
        reason: reason.to_string(),
    }
}
