//! Merges tool results into a size-bounded context bundle

use tracing::debug;

use crate::domain::{ContextBundle, ContextEntry, ToolResult};

#[derive(Debug, Clone, Copy)]
pub struct ContextAssembler {
    max_bytes: usize,
}

impl ContextAssembler {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Build the bundle for one turn.
    ///
    /// Entries keep dispatch order. While the serialized bundle is over the
    /// cap, the oldest data entry is dropped; unavailable markers go only
    /// once no data is left.
    pub fn assemble(&self, turn_id: &str, results: &[ToolResult]) -> ContextBundle {
        let mut entries: Vec<ContextEntry> = results.iter().map(to_entry).collect();
        let mut bundle = ContextBundle::from_parts(turn_id.to_string(), entries.clone(), false);
        if bundle.serialized_len() <= self.max_bytes {
            return bundle;
        }

        let candidates = entries.len();
        while !entries.is_empty() {
            let victim = entries
                .iter()
                .position(|e| e.is_data())
                .unwrap_or(0);
            entries.remove(victim);

            bundle = ContextBundle::from_parts(turn_id.to_string(), entries.clone(), true);
            if bundle.serialized_len() <= self.max_bytes {
                break;
            }
        }

        debug!(
            turn_id,
            kept = bundle.entries().len(),
            dropped = candidates - bundle.entries().len(),
            max_bytes = self.max_bytes,
            "Context truncated to fit cap"
        );
        bundle
    }
}

fn to_entry(result: &ToolResult) -> ContextEntry {
    match (&result.payload, &result.error) {
        (Some(payload), None) if result.success => {
            ContextEntry::data(&result.provider_id, &result.tool_name, payload.clone())
        }
        (_, Some(error)) => {
            ContextEntry::unavailable(&result.provider_id, &result.tool_name, error.to_string())
        }
        _ => ContextEntry::unavailable(&result.provider_id, &result.tool_name, "no result"),
    }
}
