//! Completion signals emitted by workers and the build step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::assignment::FunctionAssignment;

/// Kinds of agents in the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Fans a code unit out into function assignments.
    CodeUnitDispatcher,
    /// Implements one function assignment.
    FunctionWorker,
    /// Downstream build step.
    Builder,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::CodeUnitDispatcher => "code_unit_dispatcher",
            AgentType::FunctionWorker => "function_worker",
            AgentType::Builder => "builder",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal that an agent finished one assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMessage {
    pub worker_id: String,
    pub worker_type: AgentType,
    /// The assignment this completes.
    pub assignment_id: Uuid,
    #[serde(default)]
    pub code_unit_assignment_id: Option<Uuid>,
    #[serde(default)]
    pub function_name: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Short human-readable outcome.
    #[serde(default)]
    pub output_summary: String,
    /// Queue the implementation artifact was published to, correlated by
    /// `assignment_id`.
    #[serde(default)]
    pub artifact_queue: Option<String>,
    #[serde(default)]
    pub artifact_bytes: usize,
    #[serde(default)]
    pub quality_score: f64,
    #[serde(default)]
    pub confidence_score: f64,
    /// Cost in dollars.
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default = "Utc::now")]
    pub completed_at: DateTime<Utc>,
}

impl CompletionMessage {
    /// Creates a successful completion.
    pub fn success(
        worker_id: impl Into<String>,
        worker_type: AgentType,
        assignment_id: Uuid,
        output_summary: impl Into<String>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            worker_type,
            assignment_id,
            code_unit_assignment_id: None,
            function_name: String::new(),
            success: true,
            error: None,
            output_summary: output_summary.into(),
            artifact_queue: None,
            artifact_bytes: 0,
            quality_score: 0.0,
            confidence_score: 0.0,
            cost: 0.0,
            duration_ms: 0,
            input_tokens: 0,
            output_tokens: 0,
            completed_at: Utc::now(),
        }
    }

    /// Creates a failed completion.
    pub fn failure(
        worker_id: impl Into<String>,
        worker_type: AgentType,
        assignment_id: Uuid,
        error: impl Into<String>,
    ) -> Self {
        let error = error.into();
        let mut message = Self::success(worker_id, worker_type, assignment_id, "failed");
        message.success = false;
        message.error = Some(error);
        message
    }

    pub fn with_function(mut self, function_name: impl Into<String>) -> Self {
        self.function_name = function_name.into();
        self
    }

    pub fn with_code_unit_assignment(mut self, id: Option<Uuid>) -> Self {
        self.code_unit_assignment_id = id;
        self
    }

    /// Whether this reports a failed downstream build.
    pub fn is_build_failure(&self) -> bool {
        self.worker_type == AgentType::Builder && !self.success
    }
}

/// One function's implementation: code only, no stage report.
///
/// Published whole to its own queue because real implementations do not
/// fit the completion budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionArtifact {
    pub assignment_id: Uuid,
    #[serde(default)]
    pub code_unit_assignment_id: Option<Uuid>,
    #[serde(default)]
    pub code_unit_name: String,
    pub function_name: String,
    #[serde(default)]
    pub language: String,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl FunctionArtifact {
    pub fn new(assignment: &FunctionAssignment, content: impl Into<String>) -> Self {
        Self {
            assignment_id: assignment.assignment_id,
            code_unit_assignment_id: assignment.code_unit_assignment_id,
            code_unit_name: assignment.code_unit_name.clone(),
            function_name: assignment.function_name.clone(),
            language: assignment.language.clone(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}
