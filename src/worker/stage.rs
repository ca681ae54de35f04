//! The four function worker stages and their settings.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::messages::FunctionAssignment;
use crate::utils::extract_json_object;

/// One step of the function pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Analyze,
    Design,
    Implement,
    Validate,
}

impl Stage {
    /// Stages in execution order.
    pub const ALL: [Stage; 4] = [Stage::Analyze, Stage::Design, Stage::Implement, Stage::Validate];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Analyze => "analyze",
            Stage::Design => "design",
            Stage::Implement => "implement",
            Stage::Validate => "validate",
        }
    }

    pub fn temperature(&self) -> f64 {
        match self {
            Stage::Analyze => 0.4,
            Stage::Design => 0.3,
            Stage::Implement | Stage::Validate => 0.1,
        }
    }

    fn base_max_tokens(&self) -> u32 {
        match self {
            Stage::Analyze => 1_500,
            Stage::Design => 2_000,
            Stage::Implement => 4_000,
            Stage::Validate => 1_500,
        }
    }

    /// Token budget for this stage, capped by the agent limit.
    pub fn max_tokens(&self, agent_limit: u32) -> u32 {
        self.base_max_tokens().min(agent_limit).max(1)
    }

    pub fn system_prompt(&self, language: &str) -> String {
        match self {
            Stage::Analyze => format!(
                "You are a senior {} engineer analyzing a single function before it is written. Be concise and concrete.",
                language
            ),
            Stage::Design => format!(
                "You are a senior {} engineer designing the implementation of a single function.",
                language
            ),
            Stage::Implement => format!(
                "You are a senior {} engineer. Output only the complete implementation in one fenced code block.",
                language
            ),
            Stage::Validate => format!(
                "You are a meticulous {} code reviewer. Respond with a single JSON object.",
                language
            ),
        }
    }

    /// User prompt; `previous` is the output this stage builds on.
    pub fn user_prompt(&self, assignment: &FunctionAssignment, previous: Option<&str>) -> String {
        let mut prompt = describe(assignment);
        let previous = previous.unwrap_or_default();
        match self {
            Stage::Analyze => prompt.push_str(
                "\nSummarize the purpose, inputs and outputs, edge cases, dependencies, \
                 and any performance, security or testing concerns.",
            ),
            Stage::Design => {
                prompt.push_str("\n## Analysis\n");
                prompt.push_str(previous);
                prompt.push_str(
                    "\n\nProduce an implementation blueprint: algorithm, data structures \
                     and error handling strategy.",
                );
            }
            Stage::Implement => {
                prompt.push_str("\n## Design\n");
                prompt.push_str(previous);
                prompt.push_str(&format!(
                    "\n\nWrite the final implementation in {}. Match the signature exactly.",
                    assignment.language
                ));
            }
            Stage::Validate => {
                prompt.push_str("\n## Implementation\n```");
                prompt.push_str(&assignment.language);
                prompt.push('\n');
                prompt.push_str(previous);
                prompt.push_str(
                    "\n```\n\nReview the implementation against the requirements. Respond with \
                     {\"passed\": bool, \"issues\": [string], \"suggested_tests\": [string]}.",
                );
            }
        }
        prompt
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn describe(assignment: &FunctionAssignment) -> String {
    let mut text = format!(
        "# Function `{}` in `{}`\nLanguage: {}\nComplexity: {}/10\n",
        assignment.function_name, assignment.code_unit_name, assignment.language, assignment.complexity
    );
    for (label, value) in [
        ("Signature", &assignment.signature),
        ("Description", &assignment.description),
        ("Business logic", &assignment.business_logic),
        ("Validation rules", &assignment.validation_rules),
        ("Error handling", &assignment.error_handling),
        ("Security notes", &assignment.security_notes),
    ] {
        if !value.trim().is_empty() {
            text.push_str(&format!("{}: {}\n", label, value.trim()));
        }
    }
    text
}

/// Output of one successful stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub stage: Stage,
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub duration: Duration,
}

/// Verdict of the validate stage. Informational only.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggested_tests: Vec<String>,
}

impl ValidationReport {
    /// Parses the review from a JSON object, falling back to keywords.
    pub fn parse(text: &str) -> Self {
        if let Some(value) = extract_json_object(text) {
            if let Ok(report) = serde_json::from_value::<ValidationReport>(value) {
                return report;
            }
        }

        let lower = text.to_lowercase();
        let failed = ["fail", "incorrect", "does not compile", "bug"]
            .iter()
            .any(|k| lower.contains(k));
        let passed = !failed
            && ["pass", "approved", "looks good", "correct"]
                .iter()
                .any(|k| lower.contains(k));
        let issues = text
            .lines()
            .map(str::trim)
            .filter_map(|l| l.strip_prefix("- ").or_else(|| l.strip_prefix("* ")))
            .map(str::to_string)
            .collect();

        Self {
            passed,
            issues,
            suggested_tests: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment() -> FunctionAssignment {
        FunctionAssignment::new("s1", "Divide", "Calculator")
            .with_signature("fn divide(a: f64, b: f64) -> Result<f64, CalcError>")
            .with_description("Divides a by b")
    }

    #[test]
    fn test_stage_settings() {
        assert_eq!(Stage::Analyze.temperature(), 0.4);
        assert_eq!(Stage::Design.temperature(), 0.3);
        assert_eq!(Stage::Implement.temperature(), 0.1);
        assert_eq!(Stage::Validate.temperature(), 0.1);
        assert_eq!(Stage::Implement.max_tokens(10_000), 4_000);
        assert_eq!(Stage::Implement.max_tokens(1_000), 1_000);
        assert_eq!(Stage::ALL.len(), 4);
    }

    #[test]
    fn test_prompts_include_context() {
        let a = assignment();
        let analyze = Stage::Analyze.user_prompt(&a, None);
        assert!(analyze.contains("Divide"));
        assert!(analyze.contains("Signature: fn divide"));
        assert!(!analyze.contains("Security notes"));

        let implement = Stage::Implement.user_prompt(&a, Some("use checked division"));
        assert!(implement.contains("use checked division"));
        assert!(Stage::Implement.system_prompt("rust").contains("fenced code block"));
    }

    #[test]
    fn test_validation_report_from_json() {
        let text = "```json\n{\"passed\": false, \"issues\": [\"no zero check\"], \"suggested_tests\": [\"divide by zero\"]}\n```";
        let report = ValidationReport::parse(text);
        assert!(!report.passed);
        assert_eq!(report.issues, vec!["no zero check".to_string()]);
        assert_eq!(report.suggested_tests.len(), 1);
    }

    #[test]
    fn test_validation_report_keyword_fallback() {
        let ok = ValidationReport::parse("Looks good, the implementation is correct.");
        assert!(ok.passed);

        let bad = ValidationReport::parse("This will fail:\n- missing zero check\n- wrong type");
        assert!(!bad.passed);
        assert_eq!(bad.issues.len(), 2);
    }
}
