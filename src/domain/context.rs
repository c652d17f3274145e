//! Provenance-tagged context merged from tool results

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What an entry carries: tool output, or a marker for a failed call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryContent {
    Data { payload: Value },
    Unavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub provider_id: String,
    pub tool_name: String,
    #[serde(flatten)]
    pub content: EntryContent,
}

impl ContextEntry {
    pub fn data(provider_id: impl Into<String>, tool_name: impl Into<String>, payload: Value) -> Self {
        Self {
            provider_id: provider_id.into(),
            tool_name: tool_name.into(),
            content: EntryContent::Data { payload },
        }
    }

    pub fn unavailable(
        provider_id: impl Into<String>,
        tool_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            tool_name: tool_name.into(),
            content: EntryContent::Unavailable {
                reason: reason.into(),
            },
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self.content, EntryContent::Data { .. })
    }

    /// Inline marker text for a failed call
    pub fn marker(&self) -> Option<String> {
        match &self.content {
            EntryContent::Unavailable { reason } => Some(format!(
                "provider {}: unavailable ({})",
                self.provider_id, reason
            )),
            EntryContent::Data { .. } => None,
        }
    }
}

/// Merged context of one turn. Built once by the assembler, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    turn_id: String,
    entries: Vec<ContextEntry>,
    truncated: bool,
}

/// Provenance line sent to clients over the realtime channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSummary {
    pub provider_id: String,
    pub tool_name: String,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSummary {
    pub turn_id: String,
    pub sources: Vec<SourceSummary>,
    pub truncated: bool,
}

impl ContextBundle {
    pub(crate) fn from_parts(turn_id: String, entries: Vec<ContextEntry>, truncated: bool) -> Self {
        Self {
            turn_id,
            entries,
            truncated,
        }
    }

    pub fn empty(turn_id: impl Into<String>) -> Self {
        Self::from_parts(turn_id.into(), Vec::new(), false)
    }

    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries carrying data
    pub fn data_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_data()).count()
    }

    /// Size in bytes of the JSON serialization; this is what the size cap bounds
    pub fn serialized_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    /// Prompt text for the completion call
    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return String::new();
        }

        let mut out = String::from("Data retrieved from connected systems for this question:\n");
        for entry in &self.entries {
            match &entry.content {
                EntryContent::Data { payload } => {
                    let body = match payload {
                        Value::String(s) => s.clone(),
                        other => serde_json::to_string_pretty(other).unwrap_or_default(),
                    };
                    out.push_str(&format!(
                        "\n[{} / {}]\n{}\n",
                        entry.provider_id, entry.tool_name, body
                    ));
                }
                EntryContent::Unavailable { .. } => {
                    if let Some(marker) = entry.marker() {
                        out.push_str(&format!("\n{}\n", marker));
                    }
                }
            }
        }
        if self.truncated {
            out.push_str("\n(Some retrieved data was omitted to fit the context limit.)\n");
        }
        out
    }

    pub fn summary(&self) -> ContextSummary {
        ContextSummary {
            turn_id: self.turn_id.clone(),
            sources: self
                .entries
                .iter()
                .map(|e| SourceSummary {
                    provider_id: e.provider_id.clone(),
                    tool_name: e.tool_name.clone(),
                    available: e.is_data(),
                })
                .collect(),
            truncated: self.truncated,
        }
    }
}
