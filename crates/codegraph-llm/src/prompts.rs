//! Prompt rendering for the HTTP backend.
//!
//! Prompts ask for strict JSON so the parser can be strict in turn. The
//! stub backend never sees these: it answers from the structured task.

use crate::types::LlmTask;

/// System prompt shared by every task.
pub const SYSTEM_PROMPT: &str = "You are a precise static-analysis assistant. \
Answer with a single JSON object and nothing else: no prose, no markdown fences.";

/// Render the user prompt for a task.
#[must_use]
pub fn render(task: &LlmTask) -> String {
    match task {
        LlmTask::ExtractPois { path, content } => format!(
            "Extract every point of interest from the file below.\n\
             Reply with JSON: {{\"pois\": [{{\"name\", \"kind\", \"start_line\", \"end_line\", \
             \"description\", \"exported\"}}]}}.\n\
             Valid kinds: function, class, method, property, variable, constant, import, \
             export, interface, enum, type.\n\n\
             File: {path}\n\
             ```\n{content}\n```"
        ),
        LlmTask::ResolveRelationships {
            scope,
            level,
            pois,
            source,
        } => {
            let poi_list = pois
                .iter()
                .map(|p| format!("- {} ({}, {}) in {}", p.semantic_id, p.name, p.kind, p.file_path))
                .collect::<Vec<_>>()
                .join("\n");
            let source_block = source
                .as_deref()
                .map(|s| format!("\nSource:\n```\n{s}\n```"))
                .unwrap_or_default();
            format!(
                "Identify relationships among these points of interest ({level} scope: {scope}).\n\
                 Reply with JSON: {{\"relationships\": [{{\"from\", \"to\", \"kind\", \
                 \"confidence\", \"reason\"}}]}} where from/to are the identifiers listed below \
                 and kind is one of CALLS, USES, IMPORTS, INHERITS, COMPOSES, USES_CONFIG.\n\n\
                 {poi_list}{source_block}"
            )
        }
        LlmTask::SummarizeDirectory {
            directory,
            poi_names,
        } => format!(
            "Summarize the purpose of directory '{directory}' in two sentences, \
             given that it defines: {}.\n\
             Reply with JSON: {{\"summary\": \"...\"}}",
            poi_names.join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codegraph_types::ResolutionLevel;

    #[test]
    fn extraction_prompt_names_all_kinds() {
        let prompt = render(&LlmTask::ExtractPois {
            path: "util.js".to_string(),
            content: "function add() {}".to_string(),
        });
        assert!(prompt.contains("util.js"));
        assert!(prompt.contains("function, class, method"));
    }

    #[test]
    fn relationship_prompt_lists_semantic_ids() {
        let prompt = render(&LlmTask::ResolveRelationships {
            scope: "src".to_string(),
            level: ResolutionLevel::Directory,
            pois: vec![crate::types::PoiBrief {
                semantic_id: "util_func_add".to_string(),
                name: "add".to_string(),
                kind: codegraph_types::PoiKind::Function,
                file_path: "src/util.js".to_string(),
            }],
            source: None,
        });
        assert!(prompt.contains("util_func_add"));
        assert!(prompt.contains("directory scope"));
        assert!(prompt.contains("USES_CONFIG"));
    }
}
