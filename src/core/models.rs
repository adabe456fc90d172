//! Core data models for the translation pipeline

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a translation project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    /// Source document is being decomposed into units
    Decomposing,
    /// Units exist, translation is in progress
    Translating,
    /// Every unit carries a translation
    Ready,
    /// Output document has been written
    Exported,
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectStatus::Decomposing => write!(f, "decomposing"),
            ProjectStatus::Translating => write!(f, "translating"),
            ProjectStatus::Ready => write!(f, "ready"),
            ProjectStatus::Exported => write!(f, "exported"),
        }
    }
}

/// One document-translation effort and everything it owns
#[derive(Debug, Clone)]
pub struct Project {
    pub project_id: String,
    pub original_file: PathBuf,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Content units keyed by content id
    pub units: BTreeMap<String, ContentUnit>,
    /// Image assets keyed by image id
    pub images: BTreeMap<String, ImageAsset>,
    pub format: FormatInfo,
}

impl Project {
    /// Content ids of units that still lack a translation, ordered by spine
    /// position then sequence order
    pub fn pending_unit_ids(&self) -> Vec<String> {
        let mut pending: Vec<&ContentUnit> = self
            .units
            .values()
            .filter(|u| !u.is_translated())
            .collect();
        let spine_pos = |chapter: &str| {
            self.format
                .spine_order
                .iter()
                .position(|c| c == chapter)
                .unwrap_or(usize::MAX)
        };
        pending.sort_by_key(|u| (spine_pos(&u.chapter_id), u.sequence_order));
        pending.iter().map(|u| u.content_id.clone()).collect()
    }

    /// Whether every unit carries a translation
    pub fn is_fully_translated(&self) -> bool {
        self.units.values().all(ContentUnit::is_translated)
    }
}

/// One translatable text fragment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentUnit {
    /// Unique within the project; also the map key in the persisted document
    #[serde(skip)]
    pub content_id: String,
    pub original_text: String,
    pub translated_text: Option<String>,
    pub chapter_id: String,
    /// 1-based position within the chapter; defines reassembly order
    pub sequence_order: u32,
    pub translated_at: Option<DateTime<Utc>>,
}

impl ContentUnit {
    /// Build the deterministic content id for a chapter position.
    ///
    /// Ids derive from position, not content, so they survive upstream edits.
    pub fn make_id(chapter_id: &str, sequence_order: u32) -> String {
        format!("{}#{:06}", chapter_id, sequence_order)
    }

    pub fn new(chapter_id: impl Into<String>, sequence_order: u32, original_text: impl Into<String>) -> Self {
        let chapter_id = chapter_id.into();
        Self {
            content_id: Self::make_id(&chapter_id, sequence_order),
            original_text: original_text.into(),
            translated_text: None,
            chapter_id,
            sequence_order,
            translated_at: None,
        }
    }

    /// Translated text and timestamp are set together or not at all
    pub fn is_translated(&self) -> bool {
        self.translated_text.is_some()
    }
}

/// A binary resource carried through untouched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAsset {
    #[serde(skip)]
    pub image_id: String,
    pub original_path: String,
    /// data-URI-prefixed base64 payload
    pub base64_data: String,
    pub mime_type: String,
    pub file_size: usize,
}

/// Document metadata extracted from the source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
    pub identifier: Option<String>,
}

/// One flattened table-of-contents row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TocEntry {
    pub title: String,
    pub href: Option<String>,
    pub level: u32,
}

/// One manifest row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestItem {
    pub media_type: String,
    pub properties: Option<String>,
}

/// Structural metadata, created at decomposition and read-only afterward
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatInfo {
    pub metadata: DocumentMetadata,
    pub css_styles: BTreeMap<String, String>,
    pub spine_order: Vec<String>,
    pub toc_structure: Vec<TocEntry>,
    pub manifest_items: BTreeMap<String, ManifestItem>,
}

/// User-defined term substitutions; the version participates in fingerprints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Glossary {
    pub version: String,
    #[serde(default)]
    pub terms: BTreeMap<String, String>,
}

impl Glossary {
    /// Glossary with no terms; fingerprints use version "none"
    pub fn empty() -> Self {
        Self {
            version: "none".to_string(),
            terms: BTreeMap::new(),
        }
    }

    /// Load a glossary from a YAML file
    pub fn from_file(path: &Path) -> crate::core::errors::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let glossary: Self = serde_yaml::from_str(&content)?;
        Ok(glossary)
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// Retry behavior for transient backend failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
            jitter_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), jittered.
    ///
    /// The jitter source is the clock's subsecond nanos; good enough to
    /// de-synchronize workers without pulling in an RNG.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms as f64 * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let jitter = if self.jitter_ms > 0 {
            u64::from(Utc::now().timestamp_subsec_nanos()) % self.jitter_ms
        } else {
            0
        };
        Duration::from_millis(exp as u64 + jitter)
    }
}

/// One recorded per-unit failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitFailure {
    pub content_id: String,
    /// Error kind: transient | timeout | permanent
    pub kind: String,
    pub message: String,
}

/// Outcome of one scheduler run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    /// Units resolved by a fresh backend call
    pub succeeded: usize,
    /// Units resolved from the cache (or by joining another unit's call)
    pub cache_hits: usize,
    pub failed: Vec<UnitFailure>,
    pub cancelled: bool,
}

impl BatchSummary {
    /// Units that reached a translated state during this run
    pub fn resolved(&self) -> usize {
        self.succeeded + self.cache_hits
    }
}

/// Live progress published by the scheduler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_id_is_positional() {
        let unit = ContentUnit::new("OEBPS/chapter01.xhtml", 7, "Hello");
        assert_eq!(unit.content_id, "OEBPS/chapter01.xhtml#000007");
        // Same position, different text: same id
        let edited = ContentUnit::new("OEBPS/chapter01.xhtml", 7, "Hello, world");
        assert_eq!(unit.content_id, edited.content_id);
    }

    #[test]
    fn test_pending_follows_spine_order() {
        let mut project = Project {
            project_id: "p".into(),
            original_file: PathBuf::from("book.epub"),
            status: ProjectStatus::Translating,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            units: BTreeMap::new(),
            images: BTreeMap::new(),
            format: FormatInfo {
                spine_order: vec!["b.xhtml".into(), "a.xhtml".into()],
                ..Default::default()
            },
        };
        for (chapter, seq) in [("a.xhtml", 1), ("b.xhtml", 2), ("b.xhtml", 1)] {
            let unit = ContentUnit::new(chapter, seq, "text");
            project.units.insert(unit.content_id.clone(), unit);
        }
        let pending = project.pending_unit_ids();
        assert_eq!(
            pending,
            vec!["b.xhtml#000001", "b.xhtml#000002", "a.xhtml#000001"]
        );
    }

    #[test]
    fn test_retry_delay_grows() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 100,
            multiplier: 2.0,
            jitter_ms: 0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }
}
