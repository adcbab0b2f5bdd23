//! Human-in-the-loop channel.
//!
//! Raising an escalation suspends the pipeline until a person answers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, instrument};

use crate::vcs::{ExternalError, PermanentKind, WorkItemId};

/// A person's answer to an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum HumanResponse {
    /// Continue as if the automated checks had passed
    Approve,
    /// Send the work item back for another fix cycle
    RequestChanges,
    /// Stop processing this work item
    Abort,
}

impl HumanResponse {
    /// Parse a typed answer; accepts full words and one-letter shortcuts.
    pub fn parse_answer(answer: &str) -> Option<Self> {
        match answer.trim().to_ascii_lowercase().as_str() {
            "a" | "approve" => Some(HumanResponse::Approve),
            "r" | "changes" | "request-changes" => Some(HumanResponse::RequestChanges),
            "x" | "abort" => Some(HumanResponse::Abort),
            _ => None,
        }
    }
}

impl std::fmt::Display for HumanResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HumanResponse::Approve => write!(f, "approve"),
            HumanResponse::RequestChanges => write!(f, "request-changes"),
            HumanResponse::Abort => write!(f, "abort"),
        }
    }
}

/// Where in the pipeline the escalation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EscalationStage {
    Decision,
    CiTimeout,
    MergeFailure,
}

impl std::fmt::Display for EscalationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationStage::Decision => write!(f, "review decision"),
            EscalationStage::CiTimeout => write!(f, "CI timeout"),
            EscalationStage::MergeFailure => write!(f, "merge failure"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Escalation {
    pub work_item: WorkItemId,
    pub stage: EscalationStage,
    /// Human-readable reasons, in the order they were found
    pub rationale: Vec<String>,
}

#[async_trait]
pub trait EscalationChannel: Send + Sync {
    /// Hand the escalation to a person and wait for the answer.
    async fn raise_escalation(&self, escalation: &Escalation) -> Result<HumanResponse, ExternalError>;
}

/// Answers every escalation the same way. Used for unattended runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedResponse(pub HumanResponse);

#[async_trait]
impl EscalationChannel for FixedResponse {
    async fn raise_escalation(&self, escalation: &Escalation) -> Result<HumanResponse, ExternalError> {
        info!(
            work_item = %escalation.work_item,
            stage = %escalation.stage,
            response = %self.0,
            "escalation answered automatically"
        );
        Ok(self.0)
    }
}

/// Prints the escalation to stderr and waits for an answer on stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleEscalation;

#[async_trait]
impl EscalationChannel for ConsoleEscalation {
    #[instrument(skip_all, fields(work_item = %escalation.work_item))]
    async fn raise_escalation(&self, escalation: &Escalation) -> Result<HumanResponse, ExternalError> {
        eprintln!();
        eprintln!(
            "Escalation for {} ({}):",
            escalation.work_item, escalation.stage
        );
        for reason in &escalation.rationale {
            eprintln!("  • {reason}");
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            eprint!("Respond [a]pprove / [r]equest-changes / abort [x]: ");
            let line = lines
                .next_line()
                .await
                .map_err(|e| ExternalError::transient("read escalation response", e.to_string()))?;
            let Some(line) = line else {
                return Err(ExternalError::permanent(
                    "read escalation response",
                    PermanentKind::Rejected,
                    "stdin closed before a response was given",
                ));
            };
            if let Some(response) = HumanResponse::parse_answer(&line) {
                return Ok(response);
            }
            eprintln!("Unrecognised response: {}", line.trim());
        }
    }
}
