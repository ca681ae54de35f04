//! Work-type classification of function assignments.

use crate::messages::{FunctionAssignment, WorkType};

/// Assigns a [`WorkType`] to a function before it is spawned.
pub trait WorkClassifier: Send + Sync {
    fn classify(&self, function: &FunctionAssignment) -> WorkType;
}

/// Keyword matching over the function name and description.
///
/// Rules are checked in order and the first hit wins, so more specific
/// categories come first.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    rules: Vec<(WorkType, Vec<String>)>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        let rule = |work_type: WorkType, words: &[&str]| {
            (work_type, words.iter().map(|w| w.to_string()).collect())
        };
        Self {
            rules: vec![
                rule(
                    WorkType::Security,
                    &["auth", "password", "encrypt", "decrypt", "token", "permission", "security", "hash"],
                ),
                rule(
                    WorkType::Database,
                    &["database", "sql", "query", "repository", "persist", "migration", "table"],
                ),
                rule(
                    WorkType::Api,
                    &["api", "endpoint", "http", "request", "response", "controller", "route"],
                ),
                rule(
                    WorkType::Ui,
                    &["ui", "render", "view", "component", "display", "button", "form"],
                ),
                rule(WorkType::Testing, &["test", "mock", "assert", "fixture"]),
            ],
        }
    }
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule checked before the built-in ones.
    pub fn with_rule(mut self, work_type: WorkType, keywords: &[&str]) -> Self {
        let words = keywords.iter().map(|w| w.to_lowercase()).collect();
        self.rules.insert(0, (work_type, words));
        self
    }
}

/// Lowercased words of `text`, with camelCase names split apart.
fn words(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in text.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

impl WorkClassifier for KeywordClassifier {
    fn classify(&self, function: &FunctionAssignment) -> WorkType {
        let mut tokens = words(&function.function_name);
        tokens.extend(words(&function.description));

        // Prefix match so "queries", "rendering" and "tests" still count.
        for (work_type, keywords) in &self.rules {
            if tokens
                .iter()
                .any(|t| keywords.iter().any(|k| t.starts_with(k.as_str())))
            {
                return *work_type;
            }
        }
        WorkType::BusinessLogic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(name: &str, description: &str) -> FunctionAssignment {
        FunctionAssignment::new("spec", name, "Unit").with_description(description)
    }

    #[test]
    fn test_words_split_camel_case() {
        assert_eq!(words("SaveUserToDatabase"), vec!["save", "user", "to", "database"]);
        assert_eq!(words("render_view v2"), vec!["render", "view", "v2"]);
    }

    #[test]
    fn test_keyword_classification() {
        let classifier = KeywordClassifier::new();
        assert_eq!(
            classifier.classify(&function("SaveUser", "Persists the user to the database")),
            WorkType::Database
        );
        assert_eq!(
            classifier.classify(&function("HashPassword", "")),
            WorkType::Security
        );
        assert_eq!(
            classifier.classify(&function("HandleRequest", "HTTP endpoint for orders")),
            WorkType::Api
        );
        assert_eq!(
            classifier.classify(&function("RenderChart", "")),
            WorkType::Ui
        );
        assert_eq!(
            classifier.classify(&function("Add", "Adds two numbers")),
            WorkType::BusinessLogic
        );
    }

    #[test]
    fn test_no_substring_false_positives() {
        // "build" contains "ui" and "capital" contains "api".
        let classifier = KeywordClassifier::new();
        assert_eq!(
            classifier.classify(&function("BuildCapitalTable", "")),
            WorkType::Database
        );
        assert_eq!(
            classifier.classify(&function("BuildCapital", "")),
            WorkType::BusinessLogic
        );
    }

    #[test]
    fn test_custom_rule_takes_precedence() {
        let classifier = KeywordClassifier::new().with_rule(WorkType::Testing, &["Verify"]);
        assert_eq!(
            classifier.classify(&function("VerifyToken", "")),
            WorkType::Testing
        );
    }
}
