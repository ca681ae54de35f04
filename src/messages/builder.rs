//! Messages the dispatcher emits to the build step and to capacity planning.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::assignment::{
    CodeUnitAssignment, FunctionAssignment, PriorityLevel, WorkType, BUG_FIX_COMPLEXITY,
};
use super::completion::AgentType;

/// Notice to the build step that a code unit has been dispatched.
///
/// Exactly one is emitted per code-unit dispatch. The build step reports
/// failures back as [`BuilderError`]s on `builder.errors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuilderNotification {
    pub notification_id: Uuid,
    pub code_unit_assignment_id: Uuid,
    pub code_unit_name: String,
    #[serde(default)]
    pub project_id: String,
    /// Total functions in the code unit.
    pub function_count: usize,
    /// Completions observed during monitoring, successful or not.
    pub completed_functions: usize,
    #[serde(default)]
    pub failed_functions: usize,
    #[serde(default)]
    pub spawned_functions: usize,
    /// Functions handed off as spawn requests instead of being enqueued.
    #[serde(default)]
    pub deferred_functions: usize,
    /// Whether monitoring ended on the deadline.
    #[serde(default)]
    pub timed_out: bool,
    pub created_at: DateTime<Utc>,
}

/// Build failure report from the build step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuilderError {
    #[serde(default = "Uuid::new_v4")]
    pub error_id: Uuid,
    #[serde(default)]
    pub project_id: String,
    /// Dispatch whose notification triggered the failed build.
    #[serde(default)]
    pub code_unit_assignment_id: Option<Uuid>,
    pub code_unit_name: String,
    #[serde(default)]
    pub function_name: Option<String>,
    pub error_message: String,
    #[serde(default)]
    pub build_output: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

fn default_language() -> String {
    "rust".to_string()
}

impl BuilderError {
    /// Turns the report into a high-priority bug-fix assignment.
    pub fn to_bug_fix(&self) -> FunctionAssignment {
        let mut message = self.error_message.clone();
        if let Some(output) = &self.build_output {
            message.push_str("\n\n");
            message.push_str(output);
        }
        FunctionAssignment::bug_fix(
            self.project_id.clone(),
            self.code_unit_name.clone(),
            &message,
            self.language.clone(),
        )
    }

    /// Wraps the bug fix in a one-function code unit, so it is dispatched
    /// under the usual capacity rules and ends in a fresh notification.
    pub fn to_code_unit_assignment(&self) -> CodeUnitAssignment {
        let mut unit = CodeUnitAssignment::new(
            self.project_id.clone(),
            self.code_unit_name.clone(),
            vec![self.to_bug_fix()],
        );
        unit.code_unit_type = "bug_fix".to_string();
        unit.priority = PriorityLevel::Critical;
        unit.complexity = BUG_FIX_COMPLEXITY;
        unit
    }
}

/// Summary of how one code unit's functions were distributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadDistribution {
    pub code_unit_assignment_id: Uuid,
    pub code_unit_name: String,
    #[serde(default)]
    pub project_id: String,
    pub total_functions: usize,
    pub spawned: usize,
    pub deferred: usize,
    pub by_work_type: BTreeMap<WorkType, usize>,
    pub distributed_at: DateTime<Utc>,
}

impl WorkloadDistribution {
    pub fn new(
        code_unit_assignment_id: Uuid,
        code_unit_name: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            code_unit_assignment_id,
            code_unit_name: code_unit_name.into(),
            project_id: project_id.into(),
            total_functions: 0,
            spawned: 0,
            deferred: 0,
            by_work_type: BTreeMap::new(),
            distributed_at: Utc::now(),
        }
    }

    pub fn count(&mut self, work_type: WorkType) {
        *self.by_work_type.entry(work_type).or_insert(0) += 1;
    }
}

/// Request for capacity planning to bring up another worker later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub request_id: Uuid,
    pub project_id: String,
    pub agent_type: AgentType,
    pub code_unit_assignment_id: Option<Uuid>,
    pub code_unit_name: String,
    pub function_name: String,
    pub function_specification_id: String,
    pub priority: PriorityLevel,
    pub reason: String,
    /// Spawn attempts made before deferring.
    pub attempts: u32,
    pub requested_at: DateTime<Utc>,
}

impl SpawnRequest {
    pub fn for_function(assignment: &FunctionAssignment, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            project_id: assignment.project_id.clone(),
            agent_type: AgentType::FunctionWorker,
            code_unit_assignment_id: assignment.code_unit_assignment_id,
            code_unit_name: assignment.code_unit_name.clone(),
            function_name: assignment.function_name.clone(),
            function_specification_id: assignment.function_specification_id.clone(),
            priority: assignment.priority,
            reason: reason.into(),
            attempts,
            requested_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_error_to_bug_fix() {
        let report = BuilderError {
            error_id: Uuid::new_v4(),
            project_id: "proj".to_string(),
            code_unit_assignment_id: None,
            code_unit_name: "Calculator".to_string(),
            function_name: Some("Divide".to_string()),
            error_message: "cannot find value `x`".to_string(),
            build_output: Some("error[E0425]".to_string()),
            language: "rust".to_string(),
            occurred_at: Utc::now(),
        };

        let fix = report.to_bug_fix();
        assert!(fix.is_bug_fix);
        assert_eq!(fix.project_id, "proj");
        assert!(fix.description.contains("E0425"));
        assert!(fix.description.contains("cannot find value"));

        let unit = report.to_code_unit_assignment();
        assert_eq!(unit.code_unit_name, "Calculator");
        assert_eq!(unit.priority, PriorityLevel::Critical);
        assert_eq!(unit.function_count(), 1);
        assert!(unit.functions[0].is_bug_fix);
    }

    #[test]
    fn test_minimal_builder_error_deserializes() {
        let json = r#"{"codeUnitName": "Calculator", "errorMessage": "E0308"}"#;
        let report: BuilderError = serde_json::from_str(json).expect("should deserialize");
        assert_eq!(report.language, "rust");
        assert!(report.code_unit_assignment_id.is_none());
    }

    #[test]
    fn test_workload_distribution_counts() {
        let mut dist = WorkloadDistribution::new(Uuid::new_v4(), "Calculator", "proj");
        dist.count(WorkType::Api);
        dist.count(WorkType::Api);
        dist.count(WorkType::Database);

        assert_eq!(dist.by_work_type.get(&WorkType::Api), Some(&2));
        let json = serde_json::to_value(&dist).expect("should serialize");
        assert_eq!(json["byWorkType"]["api"], 2);
    }

    #[test]
    fn test_spawn_request_for_function() {
        let assignment = FunctionAssignment::new("s1", "Add", "Calculator")
            .with_project("proj")
            .with_priority(PriorityLevel::High);
        let request = SpawnRequest::for_function(&assignment, "global ceiling", 3);

        assert_eq!(request.agent_type, AgentType::FunctionWorker);
        assert_eq!(request.function_name, "Add");
        assert_eq!(request.priority, PriorityLevel::High);
        assert_eq!(request.attempts, 3);
    }
}
