//! Semantic identity service.
//!
//! Produces stable, human-readable identifiers for POIs of the form
//! `{file_prefix}_{kind_tag}_{normalized_name}` with an integer suffix on
//! collision. Identifiers are unique within a run; the service keeps an
//! in-memory set of used ids plus a per-file prefix cache, and can import
//! ids already persisted by an earlier phase of the same run.
//!
//! The construction is reversible: [`parse`] recovers the components of any
//! id this service generated (modulo the normalization applied when
//! generating).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use codegraph_types::PoiKind;
use thiserror::Error;

/// Maximum length of the file-derived prefix.
const MAX_PREFIX_LEN: usize = 8;

/// Maximum length of the normalized POI name.
const MAX_NAME_LEN: usize = 20;

/// File-stem abbreviations applied before length bounding.
const ABBREVIATIONS: [(&str, &str); 5] = [
    ("index", "idx"),
    ("config", "cfg"),
    ("utils", "util"),
    ("server", "srv"),
    ("client", "cli"),
];

/// Errors from identifier parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identifier '{0}' has too few segments")]
    TooFewSegments(String),

    #[error("identifier '{0}' carries unknown kind tag '{1}'")]
    UnknownKindTag(String, String),

    #[error("identifier '{0}' contains invalid characters")]
    InvalidCharacters(String),
}

/// Components recovered from a generated identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSemanticId {
    pub file_prefix: String,
    pub kind: PoiKind,
    pub name: String,
    /// Collision suffix, when one was appended.
    pub discriminator: Option<u32>,
}

/// Short canonical tag for each POI kind.
#[must_use]
pub fn kind_tag(kind: PoiKind) -> &'static str {
    match kind {
        PoiKind::Function => "func",
        PoiKind::Class => "class",
        PoiKind::Method => "method",
        PoiKind::Property => "prop",
        PoiKind::Variable => "var",
        PoiKind::Constant => "const",
        PoiKind::Import => "import",
        PoiKind::Export => "export",
        PoiKind::Interface => "iface",
        PoiKind::Enum => "enum",
        PoiKind::Type => "type",
    }
}

fn kind_from_tag(tag: &str) -> Option<PoiKind> {
    Some(match tag {
        "func" => PoiKind::Function,
        "class" => PoiKind::Class,
        "method" => PoiKind::Method,
        "prop" => PoiKind::Property,
        "var" => PoiKind::Variable,
        "const" => PoiKind::Constant,
        "import" => PoiKind::Import,
        "export" => PoiKind::Export,
        "iface" => PoiKind::Interface,
        "enum" => PoiKind::Enum,
        "type" => PoiKind::Type,
        _ => return None,
    })
}

struct IdState {
    used: HashSet<String>,
    prefix_cache: HashMap<String, String>,
}

/// Generator of within-run unique semantic ids.
///
/// Interior mutability keeps the API `&self` so the service can be shared
/// across workers; the mutex guards only the id set and prefix cache and is
/// never held across an await.
pub struct SemanticIdentityService {
    state: Mutex<IdState>,
}

impl Default for SemanticIdentityService {
    fn default() -> Self {
        Self::new()
    }
}

impl SemanticIdentityService {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IdState {
                used: HashSet::new(),
                prefix_cache: HashMap::new(),
            }),
        }
    }

    /// Seed the used-id set with identifiers already persisted for this run.
    pub fn import_existing<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock().expect("identity state poisoned");
        for id in ids {
            state.used.insert(id.into());
        }
    }

    /// Generate a unique identifier for `(file_path, name, kind)`.
    ///
    /// On collision with an id already used in this run, the lowest unused
    /// positive integer suffix is appended.
    pub fn generate(&self, file_path: &str, name: &str, kind: PoiKind) -> String {
        let mut state = self.state.lock().expect("identity state poisoned");

        let prefix = match state.prefix_cache.get(file_path) {
            Some(prefix) => prefix.clone(),
            None => {
                let prefix = file_prefix(file_path);
                state
                    .prefix_cache
                    .insert(file_path.to_string(), prefix.clone());
                prefix
            }
        };

        let base = format!("{}_{}_{}", prefix, kind_tag(kind), normalize_name(name));
        if state.used.insert(base.clone()) {
            return base;
        }

        let mut n = 2u32;
        loop {
            let candidate = format!("{base}_{n}");
            if state.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Number of identifiers handed out or imported so far.
    #[must_use]
    pub fn used_count(&self) -> usize {
        self.state.lock().expect("identity state poisoned").used.len()
    }
}

/// Recover the components of a generated identifier.
///
/// The kind tag anchors the split: the segment before it is the file
/// prefix, the segments after it are the name, and a trailing integer ≥ 2
/// is the collision discriminator.
pub fn parse(id: &str) -> Result<ParsedSemanticId, IdentityError> {
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(IdentityError::InvalidCharacters(id.to_string()));
    }

    let segments: Vec<&str> = id.split('_').collect();
    if segments.len() < 3 {
        return Err(IdentityError::TooFewSegments(id.to_string()));
    }

    let file_prefix = segments[0].to_string();
    let tag = segments[1];
    let kind = kind_from_tag(tag)
        .ok_or_else(|| IdentityError::UnknownKindTag(id.to_string(), tag.to_string()))?;

    let mut name_segments = &segments[2..];
    let mut discriminator = None;
    if name_segments.len() > 1 {
        if let Some(last) = name_segments.last() {
            // Suffixes start at 2. Trailing numbers that are part of a name
            // (e.g. sha256) never form their own segment because
            // normalization glues digits to the previous segment.
            if let Ok(n) = last.parse::<u32>() {
                if n >= 2 {
                    discriminator = Some(n);
                    name_segments = &name_segments[..name_segments.len() - 1];
                }
            }
        }
    }

    Ok(ParsedSemanticId {
        file_prefix,
        kind,
        name: name_segments.join("_"),
        discriminator,
    })
}

/// Derive the bounded, abbreviated prefix from a file path.
fn file_prefix(file_path: &str) -> String {
    let base = file_path
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_path);
    let stem = base.split('.').next().unwrap_or(base);

    let cleaned: String = stem
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();

    let abbreviated = ABBREVIATIONS
        .iter()
        .find(|(long, _)| *long == cleaned)
        .map_or(cleaned.as_str(), |(_, short)| *short)
        .to_string();

    let mut prefix: String = abbreviated.chars().take(MAX_PREFIX_LEN).collect();
    if prefix.is_empty() {
        prefix.push('f');
    }
    // A leading digit would make the prefix parse as part of a name.
    if prefix.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        prefix.insert(0, 'f');
        prefix.truncate(MAX_PREFIX_LEN);
    }
    prefix
}

/// Normalize a POI name: camelCase to snake_case, alphanumeric only,
/// separators collapsed, length bounded.
fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_underscore = true; // swallow leading separators

    for c in name.chars() {
        if c.is_ascii_uppercase() {
            if !prev_underscore {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_underscore = false;
        } else if c.is_ascii_digit() {
            // Digits glue to the previous segment: a digit-only tail would
            // be indistinguishable from a collision suffix when parsing.
            if out.ends_with('_') {
                out.pop();
            }
            out.push(c);
            prev_underscore = false;
        } else if c.is_ascii_alphanumeric() {
            out.push(c);
            prev_underscore = false;
        } else if !prev_underscore {
            out.push('_');
            prev_underscore = true;
        }
    }

    let trimmed = out.trim_matches('_');
    let mut bounded: String = trimmed.chars().take(MAX_NAME_LEN).collect();
    while bounded.ends_with('_') {
        bounded.pop();
    }
    if bounded.is_empty() {
        bounded.push_str("anon");
    }
    bounded
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn generates_spec_form_for_simple_function() {
        let svc = SemanticIdentityService::new();
        let id = svc.generate("util.js", "add", PoiKind::Function);
        assert_eq!(id, "util_func_add");
    }

    #[test]
    fn abbreviates_known_file_stems() {
        let svc = SemanticIdentityService::new();
        assert_eq!(
            svc.generate("src/config.ts", "load", PoiKind::Function),
            "cfg_func_load"
        );
        assert_eq!(
            svc.generate("index.js", "main", PoiKind::Function),
            "idx_func_main"
        );
        assert_eq!(
            svc.generate("server.py", "PORT", PoiKind::Constant),
            "srv_const_port"
        );
    }

    #[test]
    fn bounds_prefix_to_eight_chars() {
        let svc = SemanticIdentityService::new();
        let id = svc.generate("authentication.rs", "check", PoiKind::Function);
        assert_eq!(id, "authenti_func_check");
    }

    #[test]
    fn camel_case_names_become_snake_case() {
        let svc = SemanticIdentityService::new();
        let id = svc.generate("util.js", "parseQueryString", PoiKind::Function);
        assert_eq!(id, "util_func_parse_query_string");
    }

    #[test]
    fn collision_appends_lowest_unused_suffix() {
        let svc = SemanticIdentityService::new();
        let first = svc.generate("util.js", "add", PoiKind::Function);
        let second = svc.generate("util.js", "add", PoiKind::Function);
        let third = svc.generate("util.js", "add", PoiKind::Function);
        assert_eq!(first, "util_func_add");
        assert_eq!(second, "util_func_add_2");
        assert_eq!(third, "util_func_add_3");
    }

    #[test]
    fn imported_ids_block_reuse() {
        let svc = SemanticIdentityService::new();
        svc.import_existing(["util_func_add".to_string()]);
        assert_eq!(
            svc.generate("util.js", "add", PoiKind::Function),
            "util_func_add_2"
        );
    }

    #[test]
    fn parse_recovers_components() {
        let parsed = parse("util_func_parse_query_string").unwrap();
        assert_eq!(parsed.file_prefix, "util");
        assert_eq!(parsed.kind, PoiKind::Function);
        assert_eq!(parsed.name, "parse_query_string");
        assert_eq!(parsed.discriminator, None);
    }

    #[test]
    fn parse_recovers_discriminator() {
        let parsed = parse("util_func_add_2").unwrap();
        assert_eq!(parsed.name, "add");
        assert_eq!(parsed.discriminator, Some(2));
    }

    #[test]
    fn parse_rejects_unknown_tags_and_bad_chars() {
        assert!(matches!(
            parse("util_widget_add"),
            Err(IdentityError::UnknownKindTag(_, _))
        ));
        assert!(matches!(
            parse("Util_func_add"),
            Err(IdentityError::InvalidCharacters(_))
        ));
        assert!(matches!(
            parse("util_func"),
            Err(IdentityError::TooFewSegments(_))
        ));
    }

    #[test]
    fn digit_segments_glue_to_previous() {
        let svc = SemanticIdentityService::new();
        assert_eq!(
            svc.generate("util.js", "foo_2", PoiKind::Function),
            "util_func_foo2"
        );
        assert_eq!(
            svc.generate("util.js", "sha256Sum", PoiKind::Function),
            "util_func_sha256_sum"
        );
    }

    #[test]
    fn empty_name_falls_back() {
        let svc = SemanticIdentityService::new();
        let id = svc.generate("util.js", "***", PoiKind::Variable);
        assert_eq!(id, "util_var_anon");
    }

    #[test]
    fn numeric_file_stem_gets_letter_anchor() {
        let svc = SemanticIdentityService::new();
        let id = svc.generate("404.js", "handler", PoiKind::Function);
        assert!(id.starts_with('f'));
        parse(&id).unwrap();
    }

    proptest! {
        /// Every generated id parses back to its own kind, and regenerating
        /// from the parsed components is a fixed point of normalization.
        #[test]
        fn generate_parse_round_trip(
            stem in "[a-zA-Z][a-zA-Z0-9]{0,14}",
            name in "[a-zA-Z][a-zA-Z0-9_]{0,30}",
        ) {
            let svc = SemanticIdentityService::new();
            let path = format!("{stem}.js");
            let id = svc.generate(&path, &name, PoiKind::Function);
            let parsed = parse(&id).unwrap();
            prop_assert_eq!(parsed.kind, PoiKind::Function);
            prop_assert_eq!(&parsed.file_prefix, &file_prefix(&path));
            prop_assert_eq!(parsed.name, normalize_name(&name));
        }

        /// Uniqueness holds under repeated generation of the same input.
        #[test]
        fn repeated_generation_never_collides(reps in 2usize..20) {
            let svc = SemanticIdentityService::new();
            let mut seen = std::collections::HashSet::new();
            for _ in 0..reps {
                let id = svc.generate("index.js", "main", PoiKind::Function);
                prop_assert!(seen.insert(id));
            }
        }
    }
}
