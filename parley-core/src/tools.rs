//! Tool-call extraction from generated text
//!
//! Models announce tool use either with `<function_call>`/`<tool_call>`
//! tags wrapping a JSON payload or with a bare JSON object. Extraction is
//! best-effort: anything that does not parse is treated as ordinary text,
//! never as an error.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A structured tool invocation extracted from a model response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Arguments as a JSON-encoded string.
    pub arguments: String,
}

/// Scanner for tool invocations embedded in a response.
pub struct ToolCallParser {
    patterns: Vec<Regex>,
}

impl ToolCallParser {
    pub fn new() -> Self {
        // Tried in order; first match wins.
        let patterns = vec![
            Regex::new(r"(?s)<function_call>\s*(\{.*?\})\s*</function_call>")
                .expect("valid pattern"),
            Regex::new(r"(?s)<tool_call>\s*(\{.*?\})\s*</tool_call>").expect("valid pattern"),
            Regex::new(r#"\{[^{}]*"name"\s*:\s*"[^"]+"\s*,\s*"arguments"\s*:\s*\{[^{}]*\}[^{}]*\}"#)
                .expect("valid pattern"),
        ];
        Self { patterns }
    }

    /// Extract the first tool invocation from `response`, if any.
    pub fn parse(&self, response: &str) -> Option<FunctionCall> {
        for pattern in &self.patterns {
            let Some(captures) = pattern.captures(response) else {
                continue;
            };
            let json_str = captures
                .get(1)
                .or_else(|| captures.get(0))
                .map(|m| m.as_str())?;

            let Ok(value) = serde_json::from_str::<Value>(json_str) else {
                continue;
            };

            let Some(name) = value.get("name").and_then(Value::as_str) else {
                continue;
            };

            let arguments = match value.get("arguments") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };

            return Some(FunctionCall {
                name: name.to_string(),
                arguments,
            });
        }
        None
    }
}

impl Default for ToolCallParser {
    fn default() -> Self {
        Self::new()
    }
}
