pub mod decision;
pub mod types;

pub use decision::{Decision, DecisionResult, ReviewDecisionEngine};
pub use types::{ReviewKind, ReviewReport, ValidationError};

use std::path::Path;
use tracing::{debug, instrument};

/// Read a review report from disk and validate it.
///
/// Unreadable files are reported as malformed reports: either way the
/// review never reaches the decision engine.
#[instrument(fields(path = %path.display()))]
pub fn load_report(kind: ReviewKind, path: &Path) -> Result<ReviewReport, ValidationError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ValidationError::Malformed {
        kind,
        reason: format!("{}: {e}", path.display()),
    })?;
    let report = ReviewReport::from_json(kind, &contents)?;
    debug!(%kind, confidence = report.confidence, critical = report.critical_issues.len(), "loaded review report");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::types::fixtures::clean_report;

    #[test]
    fn test_load_report_from_file() {
        let path = std::env::temp_dir().join("release_pipeline_test_review.json");
        std::fs::write(&path, serde_json::to_string(&clean_report(0.9)).unwrap()).unwrap();
        let report = load_report(ReviewKind::SelfReview, &path).unwrap();
        assert_eq!(report, clean_report(0.9));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_missing_report_is_validation_error() {
        let path = std::env::temp_dir().join("release_pipeline_missing_review.json");
        let err = load_report(ReviewKind::Independent, &path).unwrap_err();
        assert!(matches!(err, ValidationError::Malformed { kind: ReviewKind::Independent, .. }));
    }
}
