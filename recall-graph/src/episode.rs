//! Episodes: atomic units of recorded experience
//!
//! Episodes are immutable apart from access bookkeeping and entity linkage,
//! which is rewritten when nodes are merged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::node::content_hash;

/// Kind of experience an episode records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeType {
    Observation,
    Decision,
    Event,
    Conversation,
}

/// Origin of the text an episode was cut from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    #[default]
    Markdown,
    Conversation,
    Manual,
}

impl SourceType {
    /// Episode type assigned to sections from this source
    pub fn episode_type(&self) -> EpisodeType {
        match self {
            Self::Conversation => EpisodeType::Conversation,
            Self::Markdown | Self::Manual => EpisodeType::Observation,
        }
    }
}

/// Reference from an episode to a node, with the role it played
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub node_id: String,
    pub role: String,
}

impl EntityRef {
    pub fn new(node_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            role: role.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub episode_type: EpisodeType,
    pub title: String,
    pub content: String,
    pub sequence: u32,
    pub participants: Vec<EntityRef>,
    pub topics: Vec<EntityRef>,
    pub importance: f64,
    pub access_count: u32,
    pub last_accessed: Option<DateTime<Utc>>,
    pub source: String,
    pub source_type: SourceType,
}

impl Episode {
    /// True if the episode references `node_id` in any role
    pub fn mentions(&self, node_id: &str) -> bool {
        self.participants
            .iter()
            .chain(self.topics.iter())
            .any(|r| r.node_id == node_id)
    }

    /// Record a read
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed = Some(now);
    }

    /// Point references at `from` to `to`, dropping duplicates. Returns true if changed.
    pub fn relink(&mut self, from: &str, to: &str) -> bool {
        let mut changed = false;
        for refs in [&mut self.participants, &mut self.topics] {
            for r in refs.iter_mut() {
                if r.node_id == from {
                    r.node_id = to.to_string();
                    changed = true;
                }
            }
            let mut seen = std::collections::HashSet::new();
            refs.retain(|r| seen.insert((r.node_id.clone(), r.role.clone())));
        }
        changed
    }
}

const DEFAULT_IMPORTANCE: f64 = 0.5;

/// Input for recording an episode
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EpisodeDraft {
    pub timestamp: Option<DateTime<Utc>>,
    pub episode_type: Option<EpisodeType>,
    pub title: String,
    pub content: String,
    pub sequence: u32,
    pub participants: Vec<EntityRef>,
    pub topics: Vec<EntityRef>,
    pub importance: Option<f64>,
    pub source: String,
    pub source_type: SourceType,
}

impl EpisodeDraft {
    /// Validate and freeze into an episode; the id hashes source, title and content
    pub fn into_episode(self, now: DateTime<Utc>) -> Result<Episode> {
        if self.content.trim().is_empty() {
            return Err(GraphError::validation("episode content must not be empty"));
        }
        let id = format!(
            "ep_{}",
            content_hash(&format!("{}\n{}\n{}", self.source, self.title, self.content))
        );
        Ok(Episode {
            id,
            timestamp: self.timestamp.unwrap_or(now),
            episode_type: self
                .episode_type
                .unwrap_or_else(|| self.source_type.episode_type()),
            title: self.title,
            content: self.content,
            sequence: self.sequence,
            participants: self.participants,
            topics: self.topics,
            importance: self
                .importance
                .filter(|v| v.is_finite())
                .unwrap_or(DEFAULT_IMPORTANCE)
                .clamp(0.0, 1.0),
            access_count: 0,
            last_accessed: None,
            source: self.source,
            source_type: self.source_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(content: &str) -> EpisodeDraft {
        EpisodeDraft {
            title: "Standup".into(),
            content: content.into(),
            source: "notes/standup.md".into(),
            participants: vec![EntityRef::new("n_marcus", "participant")],
            topics: vec![EntityRef::new("n_rust", "topic")],
            importance: Some(1.7),
            ..Default::default()
        }
    }

    #[test]
    fn test_episode_id_is_content_hash() {
        let now = Utc::now();
        let a = draft("Marcus proposed Rust").into_episode(now).unwrap();
        let b = draft("Marcus proposed Rust").into_episode(now).unwrap();
        let c = draft("Marcus proposed Go").into_episode(now).unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.importance, 1.0);
        assert_eq!(a.episode_type, EpisodeType::Observation);
    }

    #[test]
    fn test_non_finite_importance_uses_default() {
        for importance in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut d = draft("Marcus proposed Rust");
            d.importance = Some(importance);
            let episode = d.into_episode(Utc::now()).unwrap();
            assert_eq!(episode.importance, DEFAULT_IMPORTANCE);
        }
    }

    #[test]
    fn test_empty_content_rejected() {
        let result = draft("   ").into_episode(Utc::now());
        assert!(matches!(result, Err(GraphError::Validation(_))));
    }

    #[test]
    fn test_relink_dedupes() {
        let mut episode = draft("Marcus and Marc").into_episode(Utc::now()).unwrap();
        episode
            .participants
            .push(EntityRef::new("n_marc", "participant"));
        assert!(episode.relink("n_marc", "n_marcus"));
        assert_eq!(episode.participants.len(), 1);
        assert!(episode.mentions("n_marcus"));
        assert!(!episode.mentions("n_marc"));
    }

    #[test]
    fn test_touch() {
        let mut episode = draft("content").into_episode(Utc::now()).unwrap();
        episode.touch(Utc::now());
        episode.touch(Utc::now());
        assert_eq!(episode.access_count, 2);
        assert!(episode.last_accessed.is_some());
    }
}
