use serde::Serialize;

use super::types::{ReviewReport, ReviewerVerdict};

/// Confidence below which a clean review still needs a human look.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.85;

/// Final disposition of one review cycle.
///
/// The ordering is the severity lattice `Pass < Fail < Escalate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Pass,
    Fail,
    Escalate,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Pass => write!(f, "PASS"),
            Decision::Fail => write!(f, "FAIL"),
            Decision::Escalate => write!(f, "ESCALATE"),
        }
    }
}

/// The decision rules, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    CriticalIssues,
    SecurityOverride,
    CoverageGap,
    IndependentFailure,
    LowConfidence,
}

/// How a triggered rule moves the lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
    /// Join with the target: severity never decreases.
    Raise(Decision),
    /// Move to the target only while the decision is still `Pass`.
    RaiseFromPass(Decision),
    /// Set `Escalate` no matter what came before. Only the security rule
    /// has this effect.
    ForceEscalate,
}

impl Effect {
    fn apply(self, current: Decision) -> Decision {
        match self {
            Effect::Raise(target) => current.max(target),
            Effect::RaiseFromPass(target) if current == Decision::Pass => target,
            Effect::RaiseFromPass(_) => current,
            Effect::ForceEscalate => Decision::Escalate,
        }
    }
}

impl Rule {
    fn effect(self) -> Effect {
        match self {
            Rule::CriticalIssues => Effect::Raise(Decision::Fail),
            Rule::SecurityOverride => Effect::ForceEscalate,
            // Coverage gaps are fixable, not escalation-worthy on their own.
            Rule::CoverageGap => Effect::RaiseFromPass(Decision::Fail),
            Rule::IndependentFailure => Effect::RaiseFromPass(Decision::Escalate),
            Rule::LowConfidence => Effect::RaiseFromPass(Decision::Escalate),
        }
    }

    /// True for every rule that can only raise severity.
    pub fn is_monotonic(self) -> bool {
        !matches!(self.effect(), Effect::ForceEscalate)
    }
}

/// One triggered rule and the lattice state around it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RuleStep {
    pub rule: Rule,
    pub before: Decision,
    pub after: Decision,
}

/// Output of one decision. Built once per review cycle and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionResult {
    pub decision: Decision,
    pub combined_confidence: f64,
    /// Every triggered factor in rule order, followed by next-step guidance.
    pub rationale: Vec<String>,
    pub trace: Vec<RuleStep>,
}

impl DecisionResult {
    pub fn next_step(&self) -> &'static str {
        next_step(self.decision)
    }
}

fn next_step(decision: Decision) -> &'static str {
    match decision {
        Decision::Pass => "Next step: proceed to CI validation and release",
        Decision::Fail => "Next step: return to development for fixes",
        Decision::Escalate => "Next step: await human review response",
    }
}

/// Accumulates lattice movement and rationale while rules are evaluated.
struct Evaluation {
    current: Decision,
    rationale: Vec<String>,
    trace: Vec<RuleStep>,
}

impl Evaluation {
    fn new() -> Self {
        Self {
            current: Decision::Pass,
            rationale: Vec::new(),
            trace: Vec::new(),
        }
    }

    fn trigger(&mut self, rule: Rule, reason: String) {
        let before = self.current;
        self.current = rule.effect().apply(before);
        self.rationale.push(reason);
        self.trace.push(RuleStep {
            rule,
            before,
            after: self.current,
        });
    }
}

/// Merges the self review and the independent review into one decision.
#[derive(Debug, Clone, Copy)]
pub struct ReviewDecisionEngine {
    threshold: f64,
}

impl Default for ReviewDecisionEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

impl ReviewDecisionEngine {
    /// `threshold` is expected in [0, 1]; the config layer validates it.
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Decide pass / fail / escalate for a validated pair of reports.
    ///
    /// Pure: the same reports and threshold always give the same result.
    pub fn decide(&self, self_review: &ReviewReport, independent: &ReviewReport) -> DecisionResult {
        let combined_confidence = (self_review.confidence + independent.confidence) / 2.0;
        let mut eval = Evaluation::new();

        if !self_review.critical_issues.is_empty() {
            eval.trigger(
                Rule::CriticalIssues,
                format!(
                    "Self review reported {} critical issue(s): {}",
                    self_review.critical_issues.len(),
                    self_review.critical_issues.join("; ")
                ),
            );
        }

        let security = &independent.security_review;
        if !security.passed {
            let blocking = security.blocking_count();
            if blocking > 0 {
                eval.trigger(
                    Rule::SecurityOverride,
                    format!(
                        "Security review failed with {blocking} critical/high vulnerability(ies); security issues always require human review"
                    ),
                );
            }
        }

        if !independent.test_validation.coverage_adequate {
            eval.trigger(
                Rule::CoverageGap,
                format!(
                    "Test coverage is inadequate (test score {:.0})",
                    independent.test_validation.score
                ),
            );
        }

        if independent.decision == ReviewerVerdict::Fail {
            eval.trigger(
                Rule::IndependentFailure,
                "Independent review recommends failing this change".to_string(),
            );
        }

        if combined_confidence < self.threshold {
            eval.trigger(
                Rule::LowConfidence,
                format!(
                    "Combined confidence {:.2} is below threshold {:.2}",
                    combined_confidence, self.threshold
                ),
            );
        }

        let Evaluation {
            current: decision,
            mut rationale,
            trace,
        } = eval;

        if decision == Decision::Pass {
            rationale.push(format!("Security score: {:.0}/100", security.score));
            rationale.push(format!(
                "Quality score: {:.0}/100 (maintainability {:.0}, duplication {:.1}%)",
                independent.quality_analysis.score,
                independent.quality_analysis.maintainability_index,
                independent.quality_analysis.duplication_percentage
            ));
            rationale.push(format!(
                "Test score: {:.0}/100",
                independent.test_validation.score
            ));
            rationale.push(format!("Combined confidence: {combined_confidence:.2}"));
        }
        rationale.push(next_step(decision).to_string());

        DecisionResult {
            decision,
            combined_confidence,
            rationale,
            trace,
        }
    }
}
