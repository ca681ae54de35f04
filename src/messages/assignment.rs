//! Assignment messages: code units and the functions they fan out into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Complexity assigned to synthetic bug-fix work.
pub const BUG_FIX_COMPLEXITY: u8 = 8;

/// Upper bound of the complexity scale.
pub const MAX_COMPLEXITY: u8 = 10;

/// Scheduling priority label carried by assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl PriorityLevel {
    /// Numeric queue priority for this label.
    pub fn queue_priority(&self) -> i32 {
        match self {
            PriorityLevel::Low => 1,
            PriorityLevel::Medium => 5,
            PriorityLevel::High => 8,
            PriorityLevel::Critical => 10,
        }
    }

    pub fn parse(s: &str) -> Option<PriorityLevel> {
        match s.to_lowercase().trim() {
            "low" => Some(PriorityLevel::Low),
            "medium" | "normal" => Some(PriorityLevel::Medium),
            "high" => Some(PriorityLevel::High),
            "critical" | "urgent" => Some(PriorityLevel::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PriorityLevel::Low => write!(f, "low"),
            PriorityLevel::Medium => write!(f, "medium"),
            PriorityLevel::High => write!(f, "high"),
            PriorityLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Kind of work a function represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkType {
    Database,
    Ui,
    Api,
    Security,
    Testing,
    #[default]
    BusinessLogic,
}

impl WorkType {
    pub fn all() -> [WorkType; 6] {
        [
            WorkType::Database,
            WorkType::Ui,
            WorkType::Api,
            WorkType::Security,
            WorkType::Testing,
            WorkType::BusinessLogic,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkType::Database => "database",
            WorkType::Ui => "ui",
            WorkType::Api => "api",
            WorkType::Security => "security",
            WorkType::Testing => "testing",
            WorkType::BusinessLogic => "business_logic",
        }
    }
}

impl std::fmt::Display for WorkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dispatchable unit of work: a single function to implement.
///
/// Created by the dispatcher, consumed once by a function worker, never
/// modified after it is sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionAssignment {
    #[serde(default = "Uuid::new_v4")]
    pub assignment_id: Uuid,
    /// Id of the function specification this work originates from.
    pub function_specification_id: String,
    pub function_name: String,
    pub code_unit_name: String,
    /// Code-unit assignment this function was fanned out from.
    #[serde(default)]
    pub code_unit_assignment_id: Option<Uuid>,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub business_logic: String,
    #[serde(default)]
    pub validation_rules: String,
    #[serde(default)]
    pub error_handling: String,
    #[serde(default)]
    pub security_notes: String,
    /// Complexity on a 1-10 scale.
    #[serde(default = "default_complexity")]
    pub complexity: u8,
    #[serde(default)]
    pub estimated_minutes: u32,
    #[serde(default)]
    pub priority: PriorityLevel,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub work_type: WorkType,
    /// Queue the worker must report its completion to.
    #[serde(default)]
    pub completion_queue: Option<String>,
    /// Whether this is a synthetic bug-fix assignment.
    #[serde(default)]
    pub is_bug_fix: bool,
    #[serde(default = "Utc::now")]
    pub assigned_at: DateTime<Utc>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
}

fn default_complexity() -> u8 {
    5
}

fn default_language() -> String {
    "rust".to_string()
}

impl FunctionAssignment {
    /// Creates an assignment with defaults for every optional field.
    pub fn new(
        function_specification_id: impl Into<String>,
        function_name: impl Into<String>,
        code_unit_name: impl Into<String>,
    ) -> Self {
        Self {
            assignment_id: Uuid::new_v4(),
            function_specification_id: function_specification_id.into(),
            function_name: function_name.into(),
            code_unit_name: code_unit_name.into(),
            code_unit_assignment_id: None,
            project_id: String::new(),
            signature: String::new(),
            description: String::new(),
            business_logic: String::new(),
            validation_rules: String::new(),
            error_handling: String::new(),
            security_notes: String::new(),
            complexity: default_complexity(),
            estimated_minutes: 0,
            priority: PriorityLevel::default(),
            language: default_language(),
            work_type: WorkType::default(),
            completion_queue: None,
            is_bug_fix: false,
            assigned_at: Utc::now(),
            due_at: None,
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the complexity, clamped to 1-10.
    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.complexity = complexity.clamp(1, MAX_COMPLEXITY);
        self
    }

    pub fn with_priority(mut self, priority: PriorityLevel) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    /// Synthetic high-priority assignment to fix a reported build failure.
    pub fn bug_fix(
        project_id: impl Into<String>,
        code_unit_name: impl Into<String>,
        error_message: &str,
        language: impl Into<String>,
    ) -> Self {
        let code_unit_name = code_unit_name.into();
        let mut assignment = Self::new(
            format!("bugfix-{}", Uuid::new_v4()),
            format!("FixBuildErrors{}", code_unit_name),
            code_unit_name,
        )
        .with_project(project_id)
        .with_language(language)
        .with_priority(PriorityLevel::Critical)
        .with_complexity(BUG_FIX_COMPLEXITY)
        .with_description(format!(
            "Fix the build failure reported for this code unit:\n{}",
            error_message
        ));
        assignment.error_handling =
            "Resolve the reported compiler errors without changing public signatures".to_string();
        assignment.is_bug_fix = true;
        assignment
    }

    /// Numeric priority used on the queue.
    pub fn queue_priority(&self) -> i32 {
        self.priority.queue_priority()
    }

    /// Whether the function is considered complex (complexity above 5).
    pub fn is_complex(&self) -> bool {
        self.complexity > 5
    }
}

/// A class/module-level grouping of functions handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeUnitAssignment {
    #[serde(default = "Uuid::new_v4")]
    pub assignment_id: Uuid,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub code_unit_id: String,
    pub code_unit_name: String,
    /// e.g. "class", "module", "interface".
    #[serde(default)]
    pub code_unit_type: String,
    #[serde(default)]
    pub namespace: String,
    /// Functions to implement, in order.
    #[serde(default)]
    pub functions: Vec<FunctionAssignment>,
    #[serde(default)]
    pub simple_function_count: usize,
    #[serde(default)]
    pub complex_function_count: usize,
    #[serde(default = "default_complexity")]
    pub complexity: u8,
    #[serde(default)]
    pub priority: PriorityLevel,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
}

impl CodeUnitAssignment {
    pub fn new(
        project_id: impl Into<String>,
        code_unit_name: impl Into<String>,
        functions: Vec<FunctionAssignment>,
    ) -> Self {
        let mut assignment = Self {
            assignment_id: Uuid::new_v4(),
            project_id: project_id.into(),
            code_unit_id: String::new(),
            code_unit_name: code_unit_name.into(),
            code_unit_type: "class".to_string(),
            namespace: String::new(),
            functions,
            simple_function_count: 0,
            complex_function_count: 0,
            complexity: default_complexity(),
            priority: PriorityLevel::default(),
            due_at: None,
        };
        assignment.recount();
        assignment
    }

    /// Recomputes the simple/complex function counts.
    pub fn recount(&mut self) {
        self.complex_function_count = self.functions.iter().filter(|f| f.is_complex()).count();
        self.simple_function_count = self.functions.len() - self.complex_function_count;
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_levels_order() {
        assert!(PriorityLevel::Critical.queue_priority() > PriorityLevel::High.queue_priority());
        assert!(PriorityLevel::High.queue_priority() > PriorityLevel::Medium.queue_priority());
        assert!(PriorityLevel::Medium.queue_priority() > PriorityLevel::Low.queue_priority());
        assert_eq!(PriorityLevel::parse("URGENT"), Some(PriorityLevel::Critical));
        assert_eq!(PriorityLevel::parse("whenever"), None);
    }

    #[test]
    fn test_function_assignment_builder() {
        let assignment = FunctionAssignment::new("spec-1", "Add", "Calculator")
            .with_signature("fn add(a: i64, b: i64) -> i64")
            .with_complexity(42)
            .with_priority(PriorityLevel::High);

        assert_eq!(assignment.complexity, MAX_COMPLEXITY);
        assert_eq!(assignment.queue_priority(), 8);
        assert!(assignment.is_complex());
        assert!(!assignment.is_bug_fix);
    }

    #[test]
    fn test_bug_fix_assignment() {
        let fix = FunctionAssignment::bug_fix("proj", "Calculator", "E0308 mismatched types", "rust");
        assert!(fix.is_bug_fix);
        assert_eq!(fix.priority, PriorityLevel::Critical);
        assert_eq!(fix.complexity, BUG_FIX_COMPLEXITY);
        assert!(fix.description.contains("E0308"));
        assert_eq!(fix.code_unit_name, "Calculator");
    }

    #[test]
    fn test_minimal_upstream_json_deserializes() {
        let json = r#"{
            "codeUnitName": "Calculator",
            "functions": [
                {"functionSpecificationId": "s1", "functionName": "Add", "codeUnitName": "Calculator"}
            ]
        }"#;
        let unit: CodeUnitAssignment = serde_json::from_str(json).expect("should deserialize");
        assert_eq!(unit.function_count(), 1);
        assert_eq!(unit.functions[0].complexity, 5);
        assert_eq!(unit.functions[0].work_type, WorkType::BusinessLogic);
        assert!(unit.functions[0].completion_queue.is_none());
    }

    #[test]
    fn test_code_unit_recount() {
        let unit = CodeUnitAssignment::new(
            "proj",
            "Calculator",
            vec![
                FunctionAssignment::new("s1", "Add", "Calculator").with_complexity(2),
                FunctionAssignment::new("s2", "Solve", "Calculator").with_complexity(9),
            ],
        );
        assert_eq!(unit.simple_function_count, 1);
        assert_eq!(unit.complex_function_count, 1);
    }

    #[test]
    fn test_work_type_wire_names() {
        let json = serde_json::to_string(&WorkType::BusinessLogic).expect("should serialize");
        assert_eq!(json, "\"business_logic\"");
        assert_eq!(WorkType::Ui.to_string(), "ui");
    }
}
