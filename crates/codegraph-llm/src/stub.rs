//! Deterministic stub backend.
//!
//! Answers every task by coarse pattern matching over the task payload -
//! no network, no nondeterminism. This is the binding behind `--test-mode`
//! and the integration suite: the pipeline exercises its full job flow
//! while the "model" is a handful of regexes. The stub emits the same
//! JSON shape as a real provider so the response parser stays on the
//! production path.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use codegraph_types::PoiKind;

use crate::types::{LlmBackend, LlmError, LlmInvocation, LlmResponse, LlmTask, PoiBrief};

static FUNCTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:export\s+)?(?:async\s+)?function\s+([A-Za-z_$][\w$]*)").expect("regex")
});
static ARROW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*=[^=\n]*=>")
        .expect("regex")
});
static CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(?:export\s+)?class\s+([A-Za-z_$][\w$]*)").expect("regex"));
static CONST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:export\s+)?const\s+([A-Z][A-Z0-9_]*)\s*=").expect("regex")
});
static IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*import\s+(?:[^'"\n]+\s+from\s+)?['"]([^'"]+)['"]"#).expect("regex")
});
static REQUIRE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"require\(\s*['"]([^'"]+)['"]\s*\)"#).expect("regex"));
static PY_DEF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*def\s+([A-Za-z_]\w*)").expect("regex"));
static RS_FN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?fn\s+([A-Za-z_]\w*)").expect("regex")
});

/// The deterministic test-mode backend.
#[derive(Debug, Default, Clone)]
pub struct StubLlmBackend;

impl StubLlmBackend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LlmBackend for StubLlmBackend {
    async fn invoke(&self, invocation: &LlmInvocation) -> Result<LlmResponse, LlmError> {
        let raw = match &invocation.task {
            LlmTask::ExtractPois { content, .. } => extract_pois_json(content),
            LlmTask::ResolveRelationships { pois, source, .. } => {
                resolve_relationships_json(pois, source.as_deref())
            }
            LlmTask::SummarizeDirectory {
                directory,
                poi_names,
            } => serde_json::json!({
                "summary": format!(
                    "Directory '{}' defines {} points of interest: {}.",
                    directory,
                    poi_names.len(),
                    poi_names.join(", ")
                )
            })
            .to_string(),
        };
        Ok(LlmResponse {
            raw,
            provider: "stub".to_string(),
            model_used: "stub".to_string(),
            duration: Duration::ZERO,
        })
    }

    fn provider(&self) -> &str {
        "stub"
    }
}

fn line_of(content: &str, byte_idx: usize) -> u32 {
    content[..byte_idx].bytes().filter(|b| *b == b'\n').count() as u32 + 1
}

fn line_is_exported(content: &str, byte_idx: usize) -> bool {
    let line_start = content[..byte_idx].rfind('\n').map_or(0, |i| i + 1);
    let line_end = content[byte_idx..]
        .find('\n')
        .map_or(content.len(), |i| byte_idx + i);
    let line = &content[line_start..line_end];
    line.trim_start().starts_with("export") || line.contains("module.exports")
}

fn push_poi(
    seen: &mut BTreeSet<String>,
    pois: &mut Vec<serde_json::Value>,
    content: &str,
    name: &str,
    kind: PoiKind,
    at: usize,
) {
    if seen.insert(format!("{kind}:{name}")) {
        pois.push(serde_json::json!({
            "name": name,
            "kind": kind,
            "start_line": line_of(content, at),
            "end_line": line_of(content, at),
            "description": format!("{kind} {name}"),
            "exported": line_is_exported(content, at),
        }));
    }
}

fn extract_pois_json(content: &str) -> String {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut pois = Vec::new();

    for re in [&*FUNCTION_RE, &*ARROW_RE, &*PY_DEF_RE, &*RS_FN_RE] {
        for cap in re.captures_iter(content) {
            let m = cap.get(1).expect("capture group");
            push_poi(&mut seen, &mut pois, content, m.as_str(), PoiKind::Function, m.start());
        }
    }
    for cap in CLASS_RE.captures_iter(content) {
        let m = cap.get(1).expect("capture group");
        push_poi(&mut seen, &mut pois, content, m.as_str(), PoiKind::Class, m.start());
    }
    for cap in CONST_RE.captures_iter(content) {
        let m = cap.get(1).expect("capture group");
        // Arrow functions matched above take precedence over the const form.
        if !seen.contains(&format!("function:{}", m.as_str())) {
            push_poi(&mut seen, &mut pois, content, m.as_str(), PoiKind::Constant, m.start());
        }
    }
    for re in [&*IMPORT_RE, &*REQUIRE_RE] {
        for cap in re.captures_iter(content) {
            let m = cap.get(1).expect("capture group");
            push_poi(&mut seen, &mut pois, content, m.as_str(), PoiKind::Import, m.start());
        }
    }

    serde_json::json!({ "pois": pois }).to_string()
}

/// Attribute call sites to the POI whose line span contains them: POIs are
/// sorted by line, each owning [its line, next POI's line).
fn resolve_relationships_json(pois: &[PoiBrief], source: Option<&str>) -> String {
    let mut relationships = Vec::new();

    if let Some(source) = source {
        let mut spans: Vec<(u32, &PoiBrief)> = Vec::new();
        for brief in pois {
            // The brief carries no line info; recover the definition line
            // the same way extraction found it.
            if let Some(at) = find_definition(source, &brief.name) {
                spans.push((line_of(source, at), brief));
            }
        }
        spans.sort_by_key(|(line, _)| *line);

        for (target_idx, target) in pois.iter().enumerate() {
            let call = Regex::new(&format!(r"\b{}\s*\(", regex::escape(&target.name)));
            let Ok(call) = call else { continue };
            for m in call.find_iter(source) {
                let line = line_of(source, m.start());
                let Some(caller) = owner_of_line(&spans, line) else {
                    continue;
                };
                if caller.semantic_id == target.semantic_id {
                    continue;
                }
                // Skip the definition line itself.
                if spans
                    .iter()
                    .any(|(l, b)| *l == line && b.semantic_id == pois[target_idx].semantic_id)
                {
                    continue;
                }
                relationships.push(serde_json::json!({
                    "from": caller.semantic_id,
                    "to": target.semantic_id,
                    "kind": "CALLS",
                    "confidence": 0.8,
                    "reason": format!("call site at line {line}"),
                }));
            }
        }

        // Constants referenced inside another POI's span.
        for target in pois.iter().filter(|p| p.kind == codegraph_types::PoiKind::Constant) {
            let usage = Regex::new(&format!(r"\b{}\b", regex::escape(&target.name)));
            let Ok(usage) = usage else { continue };
            for m in usage.find_iter(source) {
                let line = line_of(source, m.start());
                let Some(caller) = owner_of_line(&spans, line) else {
                    continue;
                };
                if caller.semantic_id == target.semantic_id {
                    continue;
                }
                let kind = if target.name.contains("CONFIG") {
                    "USES_CONFIG"
                } else {
                    "USES"
                };
                relationships.push(serde_json::json!({
                    "from": caller.semantic_id,
                    "to": target.semantic_id,
                    "kind": kind,
                    "confidence": 0.7,
                    "reason": format!("reference at line {line}"),
                }));
                break;
            }
        }
    }

    serde_json::json!({ "relationships": relationships }).to_string()
}

fn find_definition(source: &str, name: &str) -> Option<usize> {
    let patterns = [
        format!(r"function\s+{}\b", regex::escape(name)),
        format!(r"class\s+{}\b", regex::escape(name)),
        format!(r"(?:const|let|var)\s+{}\b", regex::escape(name)),
        format!(r"def\s+{}\b", regex::escape(name)),
        format!(r"fn\s+{}\b", regex::escape(name)),
    ];
    for pattern in patterns {
        if let Ok(re) = Regex::new(&pattern) {
            if let Some(m) = re.find(source) {
                return Some(m.start());
            }
        }
    }
    None
}

fn owner_of_line<'a>(spans: &[(u32, &'a PoiBrief)], line: u32) -> Option<&'a PoiBrief> {
    spans
        .iter()
        .rev()
        .find(|(start, _)| *start <= line)
        .map(|(_, brief)| *brief)
}
