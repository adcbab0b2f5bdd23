pub mod types;

pub use types::{Report, Section, Status};

use crate::pipeline::{CiOutcome, CycleOutcome, CycleReport};
use crate::review::{Decision, DecisionResult};
use colored::Colorize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to write report file: {0}")]
    FileWrite(#[from] std::io::Error),
}

/// Build a Report from one cycle's results.
pub fn build(cycle: &CycleReport) -> Report {
    let mut sections = vec![Section::new("Review Decision", cycle.decision.rationale.clone())];

    if let Some(response) = cycle.human_response {
        sections.push(Section::new("Human Review", vec![format!("Response: {response}")]));
    }
    if let Some(ci) = &cycle.ci {
        sections.push(Section::new("CI", ci_lines(ci)));
    }

    let status = match &cycle.outcome {
        CycleOutcome::Released { merge, unblocked } => {
            let mut lines = vec![match &merge.merge_sha {
                Some(sha) => format!("Merged with {} as {sha}", merge.strategy.as_str()),
                None if merge.already_merged => "Already merged".to_string(),
                None => format!("Merged with {}", merge.strategy.as_str()),
            }];
            if !merge.already_merged && !merge.branch_deleted {
                lines.push("Source branch was not deleted".to_string());
            }
            sections.push(Section::new("Merge", lines));
            sections.push(Section::new(
                "Unblocked Work Items",
                unblocked
                    .iter()
                    .map(|item| {
                        let prereqs: Vec<&str> = item.prerequisites.iter().map(|p| p.as_str()).collect();
                        format!("{} (after {})", item.work_item, prereqs.join(", "))
                    })
                    .collect(),
            ));
            Status::Released
        }
        CycleOutcome::ReturnedForFixes { reasons } => {
            if cycle.ci.is_some() {
                sections.push(Section::new("Returned For Fixes", reasons.clone()));
            }
            Status::ReturnedForFixes
        }
        CycleOutcome::Escalated {
            stage,
            rationale,
            response,
        } => {
            let mut lines = rationale.clone();
            lines.push(format!("Response: {response}"));
            sections.push(Section::new(&format!("Escalation ({stage})"), lines));
            Status::Escalated
        }
        CycleOutcome::Aborted { .. } => Status::Aborted,
    };

    Report {
        work_item: cycle.work_item.to_string(),
        iteration: cycle.iteration,
        decision: cycle.decision.decision,
        combined_confidence: cycle.decision.combined_confidence,
        change_request: cycle
            .change_request
            .as_ref()
            .map(|cr| format!("#{} ({})", cr.id, cr.state)),
        sections,
        phases: cycle
            .metrics
            .phases
            .iter()
            .map(|timing| (timing.phase, timing.duration()))
            .collect(),
        bottlenecks: cycle.metrics.bottlenecks.clone(),
        status,
    }
}

fn ci_lines(ci: &CiOutcome) -> Vec<String> {
    match ci {
        CiOutcome::Success { snapshot } => vec![format!("All {} check(s) passed", snapshot.checks.len())],
        CiOutcome::Failure { failed_checks, .. } => vec![format!("Failed: {}", failed_checks.join(", "))],
        CiOutcome::Timeout {
            elapsed,
            passed_checks,
            unfinished_checks,
        } => {
            let mut lines = vec![format!("Timed out after {}", format_duration(*elapsed))];
            if !passed_checks.is_empty() {
                lines.push(format!("Passed: {}", passed_checks.join(", ")));
            }
            if !unfinished_checks.is_empty() {
                lines.push(format!("Unfinished: {}", unfinished_checks.join(", ")));
            }
            lines
        }
    }
}

/// Output the report to terminal (default) or to a markdown file.
#[instrument(skip(report), fields(work_item = %report.work_item, status = %report.status))]
pub fn output(report: &Report, output_path: Option<&Path>) -> Result<(), ReportError> {
    match output_path {
        None => {
            debug!("writing report to terminal");
            print_terminal_report(report);
            Ok(())
        }
        Some(path) => {
            debug!(path = %path.display(), "writing report to file");
            write_markdown_report(report, path)
        }
    }
}

/// Print a bare decision, for `decide`.
pub fn print_decision(result: &DecisionResult) {
    println!();
    println!(
        "Decision: {} (combined confidence {:.2})",
        colorize_decision(result.decision),
        result.combined_confidence
    );
    for line in &result.rationale {
        println!("  • {line}");
    }
    println!();
}

/// Format and print the report to the terminal with colors.
///
/// Work item S-1 (iteration 2)
/// Decision: PASS | Confidence: 0.93 | Change request: #7 (merged)
///
/// ═══ Review Decision ═══
/// • factor
/// ...
///
/// ═══ Result: RELEASED ═══
fn print_terminal_report(report: &Report) {
    println!();
    println!("Work item {} (iteration {})", report.work_item, report.iteration);
    println!(
        "Decision: {} | Confidence: {:.2} | Change request: {}",
        colorize_decision(report.decision),
        report.combined_confidence,
        report.change_request.as_deref().unwrap_or("none")
    );
    println!();

    for section in &report.sections {
        println!("═══ {} ═══", section.title);
        if section.lines.is_empty() {
            println!("  None.");
        }
        for line in &section.lines {
            println!("  • {line}");
        }
        println!();
    }

    if !report.phases.is_empty() {
        println!("═══ Phase Timings ═══");
        for (phase, duration) in &report.phases {
            let shown = duration.map(format_duration).unwrap_or_else(|| "unfinished".to_string());
            if report.bottlenecks.contains(phase) {
                println!("  • {phase}: {} {}", shown.yellow(), "(bottleneck)".yellow().bold());
            } else {
                println!("  • {phase}: {shown}");
            }
        }
        println!();
    }

    println!("═══ Result: {} ═══", colorize_status(report.status));
    println!();
}

/// Write the report as a markdown file.
fn write_markdown_report(report: &Report, path: &Path) -> Result<(), ReportError> {
    let mut md = String::new();
    md.push_str(&format!(
        "# Work item {} (iteration {})\n\n",
        report.work_item, report.iteration
    ));
    md.push_str(&format!(
        "**Decision:** {} | **Confidence:** {:.2} | **Change request:** {}\n\n",
        report.decision,
        report.combined_confidence,
        report.change_request.as_deref().unwrap_or("none")
    ));

    for section in &report.sections {
        md.push_str(&format!("## {}\n\n", section.title));
        if section.lines.is_empty() {
            md.push_str("None.\n\n");
        } else {
            for line in &section.lines {
                md.push_str(&format!("- {line}\n"));
            }
            md.push('\n');
        }
    }

    if !report.phases.is_empty() {
        md.push_str("## Phase Timings\n\n| Phase | Duration |\n|---|---|\n");
        for (phase, duration) in &report.phases {
            let shown = duration.map(format_duration).unwrap_or_else(|| "unfinished".to_string());
            let flag = if report.bottlenecks.contains(phase) {
                " **(bottleneck)**"
            } else {
                ""
            };
            md.push_str(&format!("| {phase} | {shown}{flag} |\n"));
        }
        md.push('\n');
    }

    md.push_str(&format!("## Result: {}\n", report.status));

    std::fs::write(path, md)?;
    Ok(())
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}.{:01}s", secs, duration.subsec_millis() / 100)
    }
}

fn colorize_decision(decision: Decision) -> colored::ColoredString {
    match decision {
        Decision::Pass => "PASS".green().bold(),
        Decision::Fail => "FAIL".yellow().bold(),
        Decision::Escalate => "ESCALATE".red().bold(),
    }
}

fn colorize_status(status: Status) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        Status::Released => text.green().bold(),
        Status::ReturnedForFixes => text.yellow().bold(),
        Status::Escalated | Status::Aborted => text.red().bold(),
    }
}
