//! Durable mapping persistence: three JSON documents per project

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::errors::{PipelineError, Result};
use crate::core::models::{ContentUnit, FormatInfo, ImageAsset, Project, ProjectStatus};

/// Bump when the persisted layout changes; loaders reject anything else
const SCHEMA_VERSION: u32 = 1;

const CONTENT_FILE: &str = "content_mapping.json";
const IMAGES_FILE: &str = "images.json";
const FORMAT_FILE: &str = "format_info.json";

#[derive(Debug, Serialize, Deserialize)]
struct ProjectInfo {
    project_id: String,
    original_file: String,
    status: ProjectStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContentDoc {
    schema_version: u32,
    project_info: ProjectInfo,
    content_mappings: BTreeMap<String, ContentUnit>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ImagesDoc {
    schema_version: u32,
    image_mappings: BTreeMap<String, ImageAsset>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FormatDoc {
    schema_version: u32,
    #[serde(flatten)]
    format: FormatInfo,
}

/// Durable, versioned persistence for one project's mapping.
///
/// All writes go through write-to-temp-then-rename, so a crash mid-save never
/// leaves a half-written document visible to a later load.
#[derive(Debug)]
pub struct MappingStore {
    dir: PathBuf,
    project: Mutex<Project>,
}

impl MappingStore {
    /// Persist a freshly decomposed project into `dir`
    pub fn create(dir: &Path, project: Project) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let store = Self {
            dir: dir.to_path_buf(),
            project: Mutex::new(project),
        };
        {
            let project = store.project.lock().unwrap();
            store.save_locked(&project)?;
        }
        info!("mapping created at {}", dir.display());
        Ok(store)
    }

    /// Load an existing mapping from `dir`.
    ///
    /// `NotFoundError` when no mapping exists there; `CorruptionError` when
    /// only a subset of the three documents is present or the persisted
    /// state is inconsistent.
    pub fn open(dir: &Path) -> Result<Self> {
        let content_path = dir.join(CONTENT_FILE);
        let images_path = dir.join(IMAGES_FILE);
        let format_path = dir.join(FORMAT_FILE);

        let present = [&content_path, &images_path, &format_path]
            .iter()
            .filter(|p| p.exists())
            .count();
        if present == 0 {
            return Err(PipelineError::NotFoundError {
                path: dir.display().to_string(),
            });
        }
        if present != 3 {
            return Err(PipelineError::CorruptionError {
                message: format!(
                    "mapping at {} has only {} of 3 documents",
                    dir.display(),
                    present
                ),
            });
        }

        let content: ContentDoc = read_doc(&content_path)?;
        let images: ImagesDoc = read_doc(&images_path)?;
        let format: FormatDoc = read_doc(&format_path)?;

        for (name, version) in [
            (CONTENT_FILE, content.schema_version),
            (IMAGES_FILE, images.schema_version),
            (FORMAT_FILE, format.schema_version),
        ] {
            if version != SCHEMA_VERSION {
                return Err(PipelineError::CorruptionError {
                    message: format!(
                        "{} has schema version {}, expected {}",
                        name, version, SCHEMA_VERSION
                    ),
                });
            }
        }

        let mut units = BTreeMap::new();
        for (content_id, mut unit) in content.content_mappings {
            unit.content_id = content_id.clone();
            if unit.translated_text.is_some() != unit.translated_at.is_some() {
                return Err(PipelineError::CorruptionError {
                    message: format!(
                        "unit {} has mismatched translated text and timestamp",
                        content_id
                    ),
                });
            }
            let expected = ContentUnit::make_id(&unit.chapter_id, unit.sequence_order);
            if expected != content_id {
                return Err(PipelineError::CorruptionError {
                    message: format!(
                        "unit {} does not match its chapter/sequence ({})",
                        content_id, expected
                    ),
                });
            }
            if !format.format.spine_order.contains(&unit.chapter_id) {
                return Err(PipelineError::CorruptionError {
                    message: format!(
                        "unit {} references chapter {} missing from the spine",
                        content_id, unit.chapter_id
                    ),
                });
            }
            units.insert(content_id, unit);
        }

        let mut image_map = BTreeMap::new();
        for (image_id, mut asset) in images.image_mappings {
            asset.image_id = image_id.clone();
            image_map.insert(image_id, asset);
        }

        let info = content.project_info;
        let project = Project {
            project_id: info.project_id,
            original_file: PathBuf::from(info.original_file),
            status: info.status,
            created_at: info.created_at,
            updated_at: info.updated_at,
            units,
            images: image_map,
            format: format.format,
        };

        debug!(
            "loaded mapping {} ({} units, {} images)",
            project.project_id,
            project.units.len(),
            project.images.len()
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            project: Mutex::new(project),
        })
    }

    /// Whether `dir` holds a mapping, without loading it
    pub fn exists(dir: &Path) -> bool {
        dir.join(CONTENT_FILE).exists()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot of the current project state
    pub fn project(&self) -> Project {
        self.project.lock().unwrap().clone()
    }

    /// Units still awaiting translation, in spine-then-sequence order
    pub fn pending_units(&self) -> Vec<ContentUnit> {
        let project = self.project.lock().unwrap();
        project
            .pending_unit_ids()
            .iter()
            .filter_map(|id| project.units.get(id).cloned())
            .collect()
    }

    /// Record a resolved translation for one unit and persist.
    ///
    /// Idempotent: re-applying an identical translation is a no-op and does
    /// not rewrite the documents. The project lock is held across mutate and
    /// persist, so concurrent updates to different units serialize cleanly.
    pub fn update_content_unit(
        &self,
        content_id: &str,
        translated_text: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let mut project = self.project.lock().unwrap();
        let unit = project.units.get_mut(content_id).ok_or_else(|| {
            PipelineError::CorruptionError {
                message: format!("unknown content id {}", content_id),
            }
        })?;

        if unit.translated_text.as_deref() == Some(translated_text) {
            return Ok(());
        }

        unit.translated_text = Some(translated_text.to_string());
        unit.translated_at = Some(timestamp);
        project.updated_at = Utc::now();
        if project.is_fully_translated() {
            project.status = ProjectStatus::Ready;
        } else {
            project.status = ProjectStatus::Translating;
        }
        self.save_locked(&project)
    }

    /// Change the project status and persist
    pub fn set_status(&self, status: ProjectStatus) -> Result<()> {
        let mut project = self.project.lock().unwrap();
        if project.status == status {
            return Ok(());
        }
        project.status = status;
        project.updated_at = Utc::now();
        self.save_locked(&project)
    }

    /// Write all three documents, each atomically
    fn save_locked(&self, project: &Project) -> Result<()> {
        let content = ContentDoc {
            schema_version: SCHEMA_VERSION,
            project_info: ProjectInfo {
                project_id: project.project_id.clone(),
                original_file: project.original_file.display().to_string(),
                status: project.status,
                created_at: project.created_at,
                updated_at: project.updated_at,
            },
            content_mappings: project
                .units
                .iter()
                .map(|(id, u)| (id.clone(), u.clone()))
                .collect(),
        };
        let images = ImagesDoc {
            schema_version: SCHEMA_VERSION,
            image_mappings: project
                .images
                .iter()
                .map(|(id, a)| (id.clone(), a.clone()))
                .collect(),
        };
        let format = FormatDoc {
            schema_version: SCHEMA_VERSION,
            format: project.format.clone(),
        };

        write_doc(&self.dir.join(CONTENT_FILE), &content)?;
        write_doc(&self.dir.join(IMAGES_FILE), &images)?;
        write_doc(&self.dir.join(FORMAT_FILE), &format)?;
        Ok(())
    }
}

fn read_doc<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| PipelineError::CorruptionError {
        message: format!("{}: {}", path.display(), e),
    })
}

fn write_doc<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    let raw = serde_json::to_string_pretty(doc)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, raw)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::DocumentMetadata;

    fn sample_project() -> Project {
        let mut units = BTreeMap::new();
        for seq in 1..=3u32 {
            let unit = ContentUnit::new("OEBPS/ch1.xhtml", seq, format!("paragraph {}", seq));
            units.insert(unit.content_id.clone(), unit);
        }
        let mut images = BTreeMap::new();
        images.insert(
            "OEBPS/cover.png".to_string(),
            ImageAsset {
                image_id: "OEBPS/cover.png".to_string(),
                original_path: "OEBPS/cover.png".to_string(),
                base64_data: "data:image/png;base64,aGk=".to_string(),
                mime_type: "image/png".to_string(),
                file_size: 2,
            },
        );
        Project {
            project_id: "epub_test".to_string(),
            original_file: PathBuf::from("/books/test.epub"),
            status: ProjectStatus::Translating,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            units,
            images,
            format: FormatInfo {
                metadata: DocumentMetadata {
                    title: Some("Test".to_string()),
                    ..Default::default()
                },
                spine_order: vec!["OEBPS/ch1.xhtml".to_string()],
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        MappingStore::create(dir.path(), sample_project()).unwrap();

        let store = MappingStore::open(dir.path()).unwrap();
        let project = store.project();
        assert_eq!(project.project_id, "epub_test");
        assert_eq!(project.units.len(), 3);
        assert_eq!(project.images.len(), 1);
        assert_eq!(project.format.spine_order, vec!["OEBPS/ch1.xhtml"]);
        assert_eq!(
            project.units["OEBPS/ch1.xhtml#000002"].original_text,
            "paragraph 2"
        );
    }

    #[test]
    fn test_persisted_document_shape() {
        use assert_json_diff::assert_json_include;

        let dir = tempfile::tempdir().unwrap();
        MappingStore::create(dir.path(), sample_project()).unwrap();

        let raw = fs::read_to_string(dir.path().join(CONTENT_FILE)).unwrap();
        let actual: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_json_include!(
            actual: actual,
            expected: serde_json::json!({
                "schema_version": 1,
                "project_info": {
                    "project_id": "epub_test",
                    "status": "translating",
                },
                "content_mappings": {
                    "OEBPS/ch1.xhtml#000002": {
                        "original_text": "paragraph 2",
                        "translated_text": null,
                        "chapter_id": "OEBPS/ch1.xhtml",
                        "sequence_order": 2,
                    },
                },
            })
        );
    }

    #[test]
    fn test_open_missing_mapping_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = MappingStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::NotFoundError { .. }));
    }

    #[test]
    fn test_partial_mapping_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        MappingStore::create(dir.path(), sample_project()).unwrap();
        fs::remove_file(dir.path().join(IMAGES_FILE)).unwrap();

        let err = MappingStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::CorruptionError { .. }));
    }

    #[test]
    fn test_unknown_schema_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        MappingStore::create(dir.path(), sample_project()).unwrap();

        let path = dir.path().join(CONTENT_FILE);
        let mut doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        doc["schema_version"] = serde_json::json!(99);
        fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();

        let err = MappingStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::CorruptionError { .. }));
    }

    #[test]
    fn test_mismatched_translation_fields_rejected() {
        let dir = tempfile::tempdir().unwrap();
        MappingStore::create(dir.path(), sample_project()).unwrap();

        let path = dir.path().join(CONTENT_FILE);
        let mut doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        // Translated text with no timestamp violates the invariant
        doc["content_mappings"]["OEBPS/ch1.xhtml#000001"]["translated_text"] =
            serde_json::json!("第一段");
        fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();

        let err = MappingStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::CorruptionError { .. }));
    }

    #[test]
    fn test_unit_chapter_must_be_in_spine() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = sample_project();
        let stray = ContentUnit::new("OEBPS/ghost.xhtml", 1, "lost");
        project.units.insert(stray.content_id.clone(), stray);
        MappingStore::create(dir.path(), project).unwrap();

        let err = MappingStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::CorruptionError { .. }));
    }

    #[test]
    fn test_update_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = MappingStore::create(dir.path(), sample_project()).unwrap();
        let ts = Utc::now();

        store
            .update_content_unit("OEBPS/ch1.xhtml#000001", "第一段", ts)
            .unwrap();
        let after_first = store.project().updated_at;

        store
            .update_content_unit("OEBPS/ch1.xhtml#000001", "第一段", Utc::now())
            .unwrap();
        // No-op: nothing was rewritten
        assert_eq!(store.project().updated_at, after_first);

        let unit = &store.project().units["OEBPS/ch1.xhtml#000001"];
        assert_eq!(unit.translated_text.as_deref(), Some("第一段"));
        assert_eq!(unit.translated_at, Some(ts));
    }

    #[test]
    fn test_pending_shrinks_and_status_flips_to_ready() {
        let dir = tempfile::tempdir().unwrap();
        let store = MappingStore::create(dir.path(), sample_project()).unwrap();
        assert_eq!(store.pending_units().len(), 3);

        for seq in 1..=3u32 {
            let id = ContentUnit::make_id("OEBPS/ch1.xhtml", seq);
            store.update_content_unit(&id, "译文", Utc::now()).unwrap();
        }
        assert!(store.pending_units().is_empty());
        assert_eq!(store.project().status, ProjectStatus::Ready);

        // Reloading preserves the resumable state
        let reloaded = MappingStore::open(dir.path()).unwrap();
        assert!(reloaded.pending_units().is_empty());
    }

    #[test]
    fn test_update_unknown_unit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = MappingStore::create(dir.path(), sample_project()).unwrap();
        let err = store
            .update_content_unit("nope#000001", "x", Utc::now())
            .unwrap_err();
        assert!(matches!(err, PipelineError::CorruptionError { .. }));
    }
}
