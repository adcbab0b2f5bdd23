use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which of the two review producers a report came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewKind {
    /// The developing agent's own review of its change.
    SelfReview,
    /// The independent reviewer's assessment.
    Independent,
}

impl std::fmt::Display for ReviewKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewKind::SelfReview => write!(f, "self review"),
            ReviewKind::Independent => write!(f, "independent review"),
        }
    }
}

/// Raised when a review report carries a score outside its documented range.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("{kind}: {field} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        kind: ReviewKind,
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Failed to parse {kind} report: {reason}")]
    Malformed { kind: ReviewKind, reason: String },
}

/// Severity of a single reported vulnerability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
    #[serde(other)]
    Unknown,
}

impl Severity {
    /// Critical and high findings are the ones that force a human decision.
    pub fn is_blocking(self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
            Severity::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vulnerability {
    pub severity: Severity,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityReview {
    pub passed: bool,
    #[serde(default)]
    pub vulnerabilities: Vec<Vulnerability>,
    /// 0..=100
    pub score: f64,
}

impl SecurityReview {
    /// Number of critical or high vulnerabilities.
    pub fn blocking_count(&self) -> usize {
        self.vulnerabilities
            .iter()
            .filter(|v| v.severity.is_blocking())
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityAnalysis {
    pub score: f64,
    pub maintainability_index: f64,
    pub duplication_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestValidation {
    pub coverage_adequate: bool,
    pub score: f64,
}

/// The verdict a single reviewer recommends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewerVerdict {
    Approve,
    Fail,
    Uncertain,
}

/// One review of a change, produced either by the implementing agent
/// (self review) or by the independent reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewReport {
    /// Reviewer confidence in its own verdict, 0..=1
    pub confidence: f64,
    #[serde(default)]
    pub critical_issues: Vec<String>,
    pub security_review: SecurityReview,
    pub quality_analysis: QualityAnalysis,
    pub test_validation: TestValidation,
    pub decision: ReviewerVerdict,
    /// When the reviewer started, if it reported it
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ReviewReport {
    /// Parse a report from its JSON wire format and validate it.
    pub fn from_json(kind: ReviewKind, json: &str) -> Result<ReviewReport, ValidationError> {
        let report: ReviewReport =
            serde_json::from_str(json).map_err(|e| ValidationError::Malformed {
                kind,
                reason: e.to_string(),
            })?;
        report.validate(kind)?;
        Ok(report)
    }

    /// Reject any score outside its stated range. Out-of-range values are
    /// never clamped silently.
    pub fn validate(&self, kind: ReviewKind) -> Result<(), ValidationError> {
        let checks: [(&'static str, f64, f64); 6] = [
            ("confidence", self.confidence, 1.0),
            ("securityReview.score", self.security_review.score, 100.0),
            ("qualityAnalysis.score", self.quality_analysis.score, 100.0),
            (
                "qualityAnalysis.maintainabilityIndex",
                self.quality_analysis.maintainability_index,
                100.0,
            ),
            (
                "qualityAnalysis.duplicationPercentage",
                self.quality_analysis.duplication_percentage,
                100.0,
            ),
            ("testValidation.score", self.test_validation.score, 100.0),
        ];

        for (field, value, max) in checks {
            // NaN fails both comparisons, so test the accepted range positively.
            if !(value >= 0.0 && value <= max) {
                return Err(ValidationError::OutOfRange {
                    kind,
                    field,
                    value,
                    min: 0.0,
                    max,
                });
            }
        }
        Ok(())
    }

    /// Time the reviewer spent, when both timestamps were reported.
    pub fn review_window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) if end >= start => Some((start, end)),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A review with no findings and high scores everywhere.
    pub fn clean_report(confidence: f64) -> ReviewReport {
        ReviewReport {
            confidence,
            critical_issues: vec![],
            security_review: SecurityReview {
                passed: true,
                vulnerabilities: vec![],
                score: 95.0,
            },
            quality_analysis: QualityAnalysis {
                score: 88.0,
                maintainability_index: 80.0,
                duplication_percentage: 3.0,
            },
            test_validation: TestValidation {
                coverage_adequate: true,
                score: 90.0,
            },
            decision: ReviewerVerdict::Approve,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn vulnerability(severity: Severity) -> Vulnerability {
        Vulnerability {
            severity,
            title: Some(format!("{severity} finding")),
            location: None,
        }
    }
}
