//! Size-budget enforcement for queued payloads.
//!
//! Payloads are measured as serialized JSON. Oversized payloads get one
//! truncation pass over their string values before being rejected.

use serde_json::Value;

/// Marker appended to every shortened string.
pub const ELLIPSIS: &str = "...";

/// Strings in structured payloads longer than this many chars are cut.
pub const FIELD_TRUNCATION_THRESHOLD: usize = 200;

/// Outcome of fitting a payload into a byte budget.
#[derive(Debug, Clone, PartialEq)]
pub enum FitOutcome {
    /// Payload already fit.
    Fits { value: Value, size: usize },
    /// Payload fit after truncating strings.
    Truncated {
        value: Value,
        original_size: usize,
        size: usize,
    },
    /// Payload is still over budget after truncation.
    TooLarge { original_size: usize, size: usize },
}

/// Serialized byte size of a JSON value.
pub fn serialized_size(value: &Value) -> Result<usize, serde_json::Error> {
    Ok(serde_json::to_vec(value)?.len())
}

/// Fits `value` into `max_bytes`, truncating string content if needed.
pub fn fit_to_budget(value: Value, max_bytes: usize) -> Result<FitOutcome, serde_json::Error> {
    let original_size = serialized_size(&value)?;
    if original_size <= max_bytes {
        return Ok(FitOutcome::Fits {
            value,
            size: original_size,
        });
    }

    let truncated = truncate_value(value, original_size, max_bytes);
    let size = serialized_size(&truncated)?;
    if size <= max_bytes {
        Ok(FitOutcome::Truncated {
            value: truncated,
            original_size,
            size,
        })
    } else {
        Ok(FitOutcome::TooLarge {
            original_size,
            size,
        })
    }
}

fn truncate_value(value: Value, original_size: usize, max_bytes: usize) -> Value {
    match value {
        Value::String(s) => {
            // Quotes and escapes count against the budget, so budget chars in
            // proportion to bytes and leave room for the marker.
            let chars = s.chars().count();
            let budget = (chars as u128 * max_bytes as u128 / original_size.max(1) as u128) as usize;
            let budget = budget.saturating_sub(ELLIPSIS.len() + 2);
            Value::String(truncate_str(&s, budget))
        }
        other => truncate_fields(other, FIELD_TRUNCATION_THRESHOLD),
    }
}

/// Cuts every string longer than `threshold` chars anywhere inside `value`.
pub fn truncate_fields(value: Value, threshold: usize) -> Value {
    match value {
        Value::String(s) if s.chars().count() > threshold => {
            Value::String(truncate_str(&s, threshold))
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| truncate_fields(item, threshold))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, item)| (key, truncate_fields(item, threshold)))
                .collect(),
        ),
        other => other,
    }
}

/// Keeps the first `max_chars` chars of `s` and appends [`ELLIPSIS`].
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    let mut out: String = s.chars().take(max_chars).collect();
    out.push_str(ELLIPSIS);
    out
}
