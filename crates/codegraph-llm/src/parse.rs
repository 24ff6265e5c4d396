//! Response parsing.
//!
//! Models are asked for bare JSON but some still wrap it in markdown
//! fences or preface it with a sentence. The parser strips fences and
//! slices from the first `{` to the last `}` before deserializing;
//! anything that still fails to parse is a validation error and the
//! evidence is dropped upstream.

use crate::types::{LlmError, PoiReport, RelationshipReport};

fn extract_json(raw: &str) -> Result<&str, LlmError> {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.strip_suffix("```").unwrap_or(rest))
        .unwrap_or(trimmed);
    let start = unfenced
        .find('{')
        .ok_or_else(|| LlmError::Parse("no JSON object in response".to_string()))?;
    let end = unfenced
        .rfind('}')
        .ok_or_else(|| LlmError::Parse("unterminated JSON object".to_string()))?;
    if end < start {
        return Err(LlmError::Parse("unterminated JSON object".to_string()));
    }
    Ok(&unfenced[start..=end])
}

/// Parse a POI extraction response.
pub fn parse_poi_report(raw: &str) -> Result<PoiReport, LlmError> {
    let json = extract_json(raw)?;
    serde_json::from_str(json).map_err(|e| LlmError::Parse(format!("poi report: {e}")))
}

/// Parse a relationship resolution response. Observations with unknown
/// relationship kinds fail the whole report: a model that invents kinds
/// is not producing usable evidence.
pub fn parse_relationship_report(raw: &str) -> Result<RelationshipReport, LlmError> {
    let json = extract_json(raw)?;
    serde_json::from_str(json).map_err(|e| LlmError::Parse(format!("relationship report: {e}")))
}

/// Parse a directory summary response.
pub fn parse_summary(raw: &str) -> Result<String, LlmError> {
    #[derive(serde::Deserialize)]
    struct SummaryReport {
        summary: String,
    }
    let json = extract_json(raw)?;
    serde_json::from_str::<SummaryReport>(json)
        .map(|r| r.summary)
        .map_err(|e| LlmError::Parse(format!("summary report: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use codegraph_types::{PoiKind, RelationshipKind};

    #[test]
    fn parses_bare_json() {
        let report = parse_poi_report(
            r#"{"pois": [{"name": "add", "kind": "function", "start_line": 1, "end_line": 1, "exported": true}]}"#,
        )
        .unwrap();
        assert_eq!(report.pois.len(), 1);
        assert_eq!(report.pois[0].kind, PoiKind::Function);
        assert_eq!(report.pois[0].description, "");
    }

    #[test]
    fn strips_markdown_fences_and_prose() {
        let raw = "Here is the analysis:\n```json\n{\"pois\": []}\n```";
        assert!(parse_poi_report(raw).unwrap().pois.is_empty());
    }

    #[test]
    fn relationship_kinds_use_wire_spelling() {
        let report = parse_relationship_report(
            r#"{"relationships": [{"from": "a_func_x", "to": "cfg_const_y", "kind": "USES_CONFIG", "confidence": 0.8}]}"#,
        )
        .unwrap();
        assert_eq!(report.relationships[0].kind, RelationshipKind::UsesConfig);
    }

    #[test]
    fn unknown_kind_is_a_parse_error() {
        let err = parse_relationship_report(
            r#"{"relationships": [{"from": "a", "to": "b", "kind": "FONDLES"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, LlmError::Parse(_)));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            parse_poi_report("the file defines a function"),
            Err(LlmError::Parse(_))
        ));
        assert!(matches!(parse_poi_report("{ truncated"), Err(LlmError::Parse(_))));
    }
}
