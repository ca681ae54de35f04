//! Extraction of code and JSON from LLM responses.
//!
//! Model output usually wraps the useful part in prose or a markdown fence.
//! These helpers pull out the fenced code for the implement stage and the
//! JSON verdict for the validate stage.

use regex::Regex;

/// A fenced markdown code block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    /// Info string after the opening fence, lowercased; empty if none.
    pub language: String,
    pub code: String,
}

/// All fenced code blocks in order of appearance.
pub fn code_blocks(content: &str) -> Vec<CodeBlock> {
    let Ok(re) = Regex::new(r"```([\w+#.-]*)[^\n]*\n([\s\S]*?)```") else {
        return Vec::new();
    };
    re.captures_iter(content)
        .filter_map(|caps| {
            let code = caps.get(2)?.as_str().trim_end().to_string();
            let language = caps
                .get(1)
                .map(|m| m.as_str().to_lowercase())
                .unwrap_or_default();
            Some(CodeBlock { language, code })
        })
        .filter(|block| !block.code.trim().is_empty())
        .collect()
}

/// Picks the code block for `language`.
///
/// Blocks tagged with the language win over untagged ones; within a group
/// the longest block wins.
pub fn extract_code_block(content: &str, language: &str) -> Option<String> {
    let language = language.to_lowercase();
    let blocks = code_blocks(content);

    let tagged = blocks
        .iter()
        .filter(|b| language_matches(&b.language, &language))
        .max_by_key(|b| b.code.len());
    if let Some(block) = tagged {
        return Some(block.code.clone());
    }

    blocks
        .iter()
        .filter(|b| b.language != "json")
        .max_by_key(|b| b.code.len())
        .map(|b| b.code.clone())
}

fn language_matches(tag: &str, language: &str) -> bool {
    if tag.is_empty() {
        return false;
    }
    tag == language
        || matches!(
            (tag, language),
            ("rs", "rust")
                | ("py", "python")
                | ("ts", "typescript")
                | ("js", "javascript")
                | ("cs", "csharp")
                | ("c#", "csharp")
        )
}

/// The implementation artifact: fenced code if present, else the trimmed
/// response.
pub fn extract_implementation(content: &str, language: &str) -> String {
    extract_code_block(content, language).unwrap_or_else(|| content.trim().to_string())
}

/// Index of the `}` matching the `{` that `s` starts with.
///
/// Braces inside string literals are ignored.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extracts a JSON object from a response.
///
/// Tries a ```json fence first, then the largest valid object anywhere,
/// preferring later ones on ties.
pub fn extract_json_object(content: &str) -> Option<serde_json::Value> {
    for block in code_blocks(content) {
        if block.language == "json" || block.language.is_empty() {
            if let Ok(value @ serde_json::Value::Object(_)) =
                serde_json::from_str::<serde_json::Value>(block.code.trim())
            {
                return Some(value);
            }
        }
    }

    let mut best: Option<(usize, serde_json::Value)> = None;
    for (start, _) in content.char_indices().filter(|(_, c)| *c == '{') {
        let substr = &content[start..];
        let Some(end) = find_matching_brace(substr) else {
            continue;
        };
        let candidate = &substr[..=end];
        if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(candidate) {
            if best.as_ref().map_or(true, |(len, _)| candidate.len() >= *len) {
                best = Some((candidate.len(), value));
            }
        }
    }
    best.map(|(_, value)| value)
}
