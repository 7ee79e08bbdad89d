//! Entity resolution
//!
//! Maps a raw mention onto an existing node or decides to mint a new one.
//! Matching runs from high to low precision: alias substitution, exact label,
//! exact alias, then fuzzy. New nodes are gated behind extraction confidence.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::ResolverConfig;
use crate::node::{node_id, Node, NodeType};

const QUOTES: &[char] = &['"', '\'', '`', '\u{201c}', '\u{201d}', '\u{2018}', '\u{2019}'];
const DASHES: &[char] = &['-', '\u{2013}', '\u{2014}'];
const TRAILING_PUNCT: &[char] = &['.', ',', ';', ':', '!', '?'];

/// Canonical comparison form of a mention
pub fn normalize(text: &str) -> String {
    let mut s = text.trim().to_lowercase();
    loop {
        let before = s.len();
        s = s.trim().to_string();
        s = s.trim_end_matches(TRAILING_PUNCT).to_string();
        if s.chars().count() >= 2
            && s.starts_with(QUOTES)
            && s.ends_with(QUOTES)
        {
            s = s.trim_matches(QUOTES).to_string();
        }
        for suffix in ["'s", "\u{2019}s"] {
            if let Some(stripped) = s.strip_suffix(suffix) {
                s = stripped.to_string();
            }
        }
        s = s.trim_matches(DASHES).to_string();
        if s.len() == before {
            break;
        }
    }
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Levenshtein distance over chars
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Jaccard ratio of whitespace token sets
pub fn token_overlap(a: &str, b: &str) -> f64 {
    let ta: HashSet<&str> = a.split_whitespace().collect();
    let tb: HashSet<&str> = b.split_whitespace().collect();
    let union = ta.union(&tb).count();
    if union == 0 {
        return 0.0;
    }
    ta.intersection(&tb).count() as f64 / union as f64
}

/// Raw entity candidate produced by the extraction collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEntity {
    pub text: String,
    #[serde(rename = "type")]
    pub entity_type: NodeType,
    /// Extraction confidence in `[0, 1]`
    pub confidence: f64,
    /// Which extractor signal produced the candidate (heading, wikilink, ...)
    #[serde(default)]
    pub source_signal: String,
    /// Character offset within the section
    #[serde(default)]
    pub position: usize,
}

impl RawEntity {
    pub fn new(text: impl Into<String>, entity_type: NodeType, confidence: f64) -> Self {
        Self {
            text: text.into(),
            entity_type,
            confidence,
            source_signal: String::new(),
            position: 0,
        }
    }
}

/// Which rule matched an existing node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchKind {
    Label,
    Alias,
    Fuzzy,
}

/// Why a mention was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DropReason {
    Empty,
    TooShort,
    Ignored,
    LowConfidence,
}

/// Outcome of resolving one mention
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Existing {
        id: String,
        matched: MatchKind,
        /// The surface form, when it differs from the node label
        surface: Option<String>,
    },
    New {
        id: String,
        label: String,
        node_type: NodeType,
    },
    Dropped(DropReason),
}

impl Resolution {
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Existing { id, .. } | Self::New { id, .. } => Some(id),
            Self::Dropped(_) => None,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::New { .. })
    }
}

/// Resolver bound to a configuration; stateless between calls
pub struct EntityResolver {
    config: ResolverConfig,
    ignore: HashSet<String>,
    aliases: BTreeMap<String, String>,
    /// Normalized alias key to target; the first raw key in order wins
    normalized_aliases: BTreeMap<String, String>,
}

impl EntityResolver {
    pub fn new(config: ResolverConfig) -> Self {
        let ignore = config.ignore.iter().map(|s| normalize(s)).collect();
        let aliases: BTreeMap<String, String> = config
            .aliases
            .iter()
            .map(|(from, to)| (from.trim().to_string(), to.trim().to_string()))
            .collect();
        let mut normalized_aliases = BTreeMap::new();
        for (from, to) in &aliases {
            normalized_aliases
                .entry(normalize(from))
                .or_insert_with(|| to.clone());
        }
        Self {
            config,
            ignore,
            aliases,
            normalized_aliases,
        }
    }

    /// Alias substitution: exact raw text first, then normalized text
    fn canonical(&self, raw: &str) -> String {
        let raw = raw.trim();
        if let Some(target) = self.aliases.get(raw) {
            return target.clone();
        }
        let normalized = normalize(raw);
        if let Some(target) = self.aliases.get(&normalized) {
            return target.clone();
        }
        self.normalized_aliases
            .get(&normalized)
            .cloned()
            .unwrap_or_else(|| raw.to_string())
    }

    fn fuzzy_matches(&self, mention: &str, label: &str) -> bool {
        let limit = self.config.short_form_max_len;
        if mention.chars().count() <= limit && label.chars().count() <= limit {
            edit_distance(mention, label) <= self.config.max_edit_distance
        } else {
            token_overlap(mention, label) >= self.config.min_token_overlap
        }
    }

    /// Resolve `mention` against `nodes`, which must be in insertion order
    pub fn resolve(&self, mention: &RawEntity, nodes: &[Node]) -> Resolution {
        let normalized = normalize(&mention.text);
        if normalized.is_empty() {
            return Resolution::Dropped(DropReason::Empty);
        }
        if normalized.chars().count() <= 1 {
            return Resolution::Dropped(DropReason::TooShort);
        }
        if self.ignore.contains(&normalized) {
            return Resolution::Dropped(DropReason::Ignored);
        }

        let canonical = self.canonical(&mention.text);
        let key = normalize(&canonical);
        let surface = |node: &Node| {
            let raw = mention.text.trim();
            (normalize(raw) != normalize(&node.label)).then(|| raw.to_string())
        };

        if let Some(node) = nodes.iter().find(|n| normalize(&n.label) == key) {
            return Resolution::Existing {
                id: node.id.clone(),
                matched: MatchKind::Label,
                surface: surface(node),
            };
        }

        if let Some(node) = nodes
            .iter()
            .find(|n| n.aliases.iter().any(|a| normalize(a) == key))
        {
            return Resolution::Existing {
                id: node.id.clone(),
                matched: MatchKind::Alias,
                surface: surface(node),
            };
        }

        if let Some(node) = nodes
            .iter()
            .find(|n| self.fuzzy_matches(&key, &normalize(&n.label)))
        {
            return Resolution::Existing {
                id: node.id.clone(),
                matched: MatchKind::Fuzzy,
                surface: surface(node),
            };
        }

        if mention.confidence > self.config.min_new_confidence {
            let label = canonical.trim().trim_end_matches(TRAILING_PUNCT).to_string();
            return Resolution::New {
                id: node_id(&label),
                label,
                node_type: mention.entity_type,
            };
        }

        Resolution::Dropped(DropReason::LowConfidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn resolver() -> EntityResolver {
        EntityResolver::new(ResolverConfig::default())
    }

    fn node(label: &str, node_type: NodeType) -> Node {
        Node::new(label, node_type, Utc::now())
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Marcus   Aurelius  "), "marcus aurelius");
        assert_eq!(normalize("\"RocksDB\""), "rocksdb");
        assert_eq!(normalize("Marcus's"), "marcus");
        assert_eq!(normalize("Marcus\u{2019}s"), "marcus");
        assert_eq!(normalize("- Rust -"), "rust");
        assert_eq!(normalize("Tokio!!"), "tokio");
        assert_eq!(normalize("'Project X'."), "project x");
        assert_eq!(normalize("   "), "");
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("marcus", "marcus"), 0);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("marcus", "markus"), 1);
    }

    #[test]
    fn test_rejects_short_empty_and_ignored() {
        let r = resolver();
        let nodes = vec![];
        assert_eq!(
            r.resolve(&RawEntity::new("  ", NodeType::Concept, 0.9), &nodes),
            Resolution::Dropped(DropReason::Empty)
        );
        assert_eq!(
            r.resolve(&RawEntity::new("X", NodeType::Concept, 0.9), &nodes),
            Resolution::Dropped(DropReason::TooShort)
        );
        assert_eq!(
            r.resolve(&RawEntity::new("Today", NodeType::Event, 0.9), &nodes),
            Resolution::Dropped(DropReason::Ignored)
        );
    }

    #[test]
    fn test_exact_label_before_fuzzy() {
        let r = resolver();
        let nodes = vec![node("Markus", NodeType::Person), node("Marcus", NodeType::Person)];
        let res = r.resolve(&RawEntity::new("marcus", NodeType::Person, 0.9), &nodes);
        assert_eq!(res.id(), Some(nodes[1].id.as_str()));
        assert!(matches!(
            res,
            Resolution::Existing {
                matched: MatchKind::Label,
                ..
            }
        ));
    }

    #[test]
    fn test_alias_match() {
        let r = resolver();
        let mut postgres = node("PostgreSQL", NodeType::Tool);
        postgres.add_alias("Postgres");
        let nodes = vec![postgres];
        let res = r.resolve(&RawEntity::new("postgres", NodeType::Tool, 0.2), &nodes);
        assert!(matches!(
            res,
            Resolution::Existing {
                matched: MatchKind::Alias,
                ..
            }
        ));
    }

    #[test]
    fn test_alias_table_substitution() {
        let mut config = ResolverConfig::default();
        config
            .aliases
            .insert("k8s".to_string(), "Kubernetes".to_string());
        let r = EntityResolver::new(config);

        let res = r.resolve(&RawEntity::new("K8s", NodeType::Tool, 0.9), &[]);
        match res {
            Resolution::New { label, id, .. } => {
                assert_eq!(label, "Kubernetes");
                assert_eq!(id, node_id("kubernetes"));
            }
            other => panic!("expected new node, got {:?}", other),
        }
    }

    #[test]
    fn test_fuzzy_first_match_wins_in_order() {
        let r = resolver();
        let nodes = vec![node("Marko", NodeType::Person), node("Marcos", NodeType::Person)];
        let res = r.resolve(&RawEntity::new("Marco", NodeType::Person, 0.9), &nodes);
        assert_eq!(res.id(), Some(nodes[0].id.as_str()));
    }

    #[test]
    fn test_long_forms_use_token_overlap() {
        let r = resolver();
        let nodes = vec![node("memory graph consolidation pipeline", NodeType::Project)];
        let hit = r.resolve(
            &RawEntity::new("memory graph consolidation", NodeType::Project, 0.9),
            &nodes,
        );
        assert!(matches!(
            hit,
            Resolution::Existing {
                matched: MatchKind::Fuzzy,
                ..
            }
        ));

        let miss = r.resolve(
            &RawEntity::new("vector search benchmark suite", NodeType::Project, 0.9),
            &nodes,
        );
        assert!(miss.is_new());
    }

    #[test]
    fn test_new_node_gated_by_confidence() {
        let r = resolver();
        assert_eq!(
            r.resolve(&RawEntity::new("Quokka", NodeType::Concept, 0.5), &[]),
            Resolution::Dropped(DropReason::LowConfidence)
        );
        assert!(r
            .resolve(&RawEntity::new("Quokka", NodeType::Concept, 0.51), &[])
            .is_new());
    }

    #[test]
    fn test_colliding_aliases_resolve_deterministically() {
        let mut config = ResolverConfig::default();
        config.aliases.insert("PG".into(), "Postgres".into());
        config.aliases.insert("pg.".into(), "Pagination".into());
        config.aliases.insert("P.G.".into(), "Procter".into());
        let nodes = vec![node("Postgres", NodeType::Tool), node("Pagination", NodeType::Concept)];

        for _ in 0..10 {
            let r = EntityResolver::new(config.clone());
            let resolution = r.resolve(&RawEntity::new("Pg", NodeType::Tool, 0.9), &nodes);
            assert_eq!(resolution.id(), Some(nodes[0].id.as_str()));
        }
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let r = resolver();
        let nodes = vec![node("Tokio", NodeType::Tool), node("Marcus", NodeType::Person)];
        let mention = RawEntity::new("Marcus's", NodeType::Person, 0.9);
        let first = r.resolve(&mention, &nodes);
        let second = r.resolve(&mention, &nodes);
        assert_eq!(first, second);
        assert_eq!(first.id(), Some(nodes[1].id.as_str()));
    }
}
