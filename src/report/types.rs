use std::time::Duration;

use crate::pipeline::Phase;
use crate::review::Decision;

/// Final status of a cycle, as shown in the report banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Released,
    ReturnedForFixes,
    Escalated,
    Aborted,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Released => write!(f, "RELEASED"),
            Status::ReturnedForFixes => write!(f, "RETURNED FOR FIXES"),
            Status::Escalated => write!(f, "ESCALATED"),
            Status::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// One titled block of the report.
#[derive(Debug, Clone)]
pub struct Section {
    pub title: String,
    pub lines: Vec<String>,
}

impl Section {
    pub fn new(title: &str, lines: Vec<String>) -> Self {
        Self {
            title: title.to_string(),
            lines,
        }
    }
}

/// Rendered view of one pipeline cycle.
#[derive(Debug)]
pub struct Report {
    pub work_item: String,
    pub iteration: u32,
    pub decision: Decision,
    pub combined_confidence: f64,
    /// `#id (state)` of the change request, once one was opened
    pub change_request: Option<String>,
    pub sections: Vec<Section>,
    /// Timed phases in pipeline order; `None` for phases still open
    pub phases: Vec<(Phase, Option<Duration>)>,
    pub bottlenecks: Vec<Phase>,
    pub status: Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Released.to_string(), "RELEASED");
        assert_eq!(Status::ReturnedForFixes.to_string(), "RETURNED FOR FIXES");
        assert_eq!(Status::Escalated.to_string(), "ESCALATED");
        assert_eq!(Status::Aborted.to_string(), "ABORTED");
    }
}
