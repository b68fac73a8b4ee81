//! Risk Assessment
//!
//! Pure re-evaluation of a node classification's risk tier with a
//! human-readable recommendation.

use serde::{Deserialize, Serialize};

use crate::node::{NodeClassification, RiskLevel};

/// Outcome of a risk assessment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub address: String,
    pub risk_level: RiskLevel,
    /// Signals that escalated the stored level
    pub factors: Vec<String>,
    pub recommendation: String,
}

/// Recommendation text for a risk tier
pub fn recommendation(level: RiskLevel) -> &'static str {
    match level {
        RiskLevel::Critical => "do not transact",
        RiskLevel::High => "enhanced due diligence",
        RiskLevel::Medium => "standard due diligence",
        RiskLevel::Low => "standard monitoring",
        RiskLevel::Unknown => "manual review required",
    }
}

/// Assess the risk of a classified address
///
/// Starts from the stored level and only escalates: suspicious activity
/// raises it to at least HIGH, blacklist or sanction reasons to CRITICAL.
pub fn assess_risk(classification: &NodeClassification) -> RiskAssessment {
    let mut level = classification.risk_level;
    let mut factors = Vec::new();

    if !classification.suspicious_activities.is_empty() {
        level = level.escalate(RiskLevel::High);
        factors.extend(
            classification
                .suspicious_activities
                .iter()
                .map(|a| format!("suspicious: {a}")),
        );
    }

    if !classification.blacklist_reasons.is_empty() {
        level = level.escalate(RiskLevel::Critical);
        factors.extend(
            classification
                .blacklist_reasons
                .iter()
                .map(|r| format!("blacklisted: {r}")),
        );
    }

    if !classification.sanction_reasons.is_empty() {
        level = level.escalate(RiskLevel::Critical);
        factors.extend(
            classification
                .sanction_reasons
                .iter()
                .map(|r| format!("sanctioned: {r}")),
        );
    }

    RiskAssessment {
        address: classification.address.clone(),
        risk_level: level,
        factors,
        recommendation: recommendation(level).to_string(),
    }
}
