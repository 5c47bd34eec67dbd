//! Workflow data model: run snapshot, step vocabulary, and the explicit
//! step → processing-classification table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Pause reason recorded when the automation driver vanishes mid-run.
pub const PAUSE_REASON_DISCONNECTED: &str = "driver-disconnected";

/// The two declared business processes. Each gets its own orchestrator
/// instance and selector vocabulary; both share one run-loop pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    Manager,
    Other,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::Manager => "manager",
            WorkflowType::Other => "other",
        }
    }

    pub fn from_path(s: &str) -> Option<Self> {
        match s {
            "manager" => Some(WorkflowType::Manager),
            "other" => Some(WorkflowType::Other),
            _ => None,
        }
    }

    /// Page the run navigates to for one work item.
    pub fn item_path(&self, item_id: &str) -> String {
        format!("/{}/approvals/{}", self.as_str(), item_id)
    }

    /// Selector for the approval action on this workflow's page.
    pub fn action_selector(&self) -> &'static str {
        match self {
            WorkflowType::Manager => "#approve-btn",
            WorkflowType::Other => "#endorse-btn",
        }
    }

    pub fn confirm_selector(&self) -> &'static str {
        "#confirm-dialog .confirm"
    }

    /// Element whose appearance proves the item went through.
    pub fn verify_selector(&self) -> &'static str {
        match self {
            WorkflowType::Manager => ".status-approved",
            WorkflowType::Other => ".status-endorsed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
    Cancelled,
}

/// Named steps shared by both workflow types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStep {
    Idle,
    AcquiringDriver,
    Navigating,
    Approving,
    SubmittingRecord,
    Verifying,
    Finalizing,
}

/// How a step is processed, used by clients to pick between spinner,
/// server-driven wait, and plain progress display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingClass {
    Never,
    Always,
    ServerControlled,
    Transitional,
    ProgressUntilDone,
}

impl WorkflowStep {
    /// The step → classification table. One place, not scattered booleans.
    pub fn classification(self) -> ProcessingClass {
        match self {
            WorkflowStep::Idle => ProcessingClass::Never,
            WorkflowStep::AcquiringDriver => ProcessingClass::Transitional,
            WorkflowStep::Navigating => ProcessingClass::Transitional,
            WorkflowStep::Approving => ProcessingClass::ServerControlled,
            WorkflowStep::SubmittingRecord => ProcessingClass::Always,
            WorkflowStep::Verifying => ProcessingClass::ProgressUntilDone,
            WorkflowStep::Finalizing => ProcessingClass::Transitional,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// 1-based position of the item currently being processed.
    pub current: usize,
    pub total: usize,
    pub current_item_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemOutcome {
    Approved,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResults {
    pub approved_count: usize,
    pub error_count: usize,
    /// Per-item outcome, keyed by item id. Only grows or has entries
    /// overwritten; never shrinks during a run.
    pub transaction_results: HashMap<String, ItemOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
}

/// Read-only snapshot of one workflow's live run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub status: RunStatus,
    pub current_step: WorkflowStep,
    pub step_classification: ProcessingClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub results: RunResults,
}

impl WorkflowRun {
    pub fn idle() -> Self {
        Self {
            status: RunStatus::Idle,
            current_step: WorkflowStep::Idle,
            step_classification: WorkflowStep::Idle.classification(),
            progress: None,
            error: None,
            results: RunResults::default(),
        }
    }

    /// Keep the derived classification in sync with the step.
    pub fn set_step(&mut self, step: WorkflowStep) {
        self.current_step = step;
        self.step_classification = step.classification();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_snapshot() {
        let run = WorkflowRun::idle();
        assert_eq!(run.status, RunStatus::Idle);
        assert_eq!(run.step_classification, ProcessingClass::Never);
        assert!(run.progress.is_none());
        assert!(run.results.transaction_results.is_empty());
    }

    #[test]
    fn test_step_classification_follows_step() {
        let mut run = WorkflowRun::idle();
        run.set_step(WorkflowStep::Verifying);
        assert_eq!(run.step_classification, ProcessingClass::ProgressUntilDone);
    }

    #[test]
    fn test_workflow_type_paths() {
        assert_eq!(WorkflowType::from_path("manager"), Some(WorkflowType::Manager));
        assert_eq!(WorkflowType::from_path("other"), Some(WorkflowType::Other));
        assert_eq!(WorkflowType::from_path("managerial"), None);
        assert_eq!(
            WorkflowType::Manager.item_path("REQ-1"),
            "/manager/approvals/REQ-1"
        );
    }

    #[test]
    fn test_run_serializes_kebab_case() {
        let mut run = WorkflowRun::idle();
        run.status = RunStatus::Running;
        run.set_step(WorkflowStep::SubmittingRecord);
        let v = serde_json::to_value(&run).unwrap();
        assert_eq!(v["status"], "running");
        assert_eq!(v["current_step"], "submitting-record");
        assert_eq!(v["step_classification"], "always");
    }
}
