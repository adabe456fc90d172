//! EPUB decomposition into a mapped project

use std::collections::BTreeMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use epub::doc::{EpubDoc, NavPoint};
use tracing::{debug, info, warn};

use crate::core::errors::{PipelineError, Result};
use crate::core::models::{
    ContentUnit, DocumentMetadata, FormatInfo, ImageAsset, ManifestItem, Project, ProjectStatus,
    TocEntry,
};
use crate::processors::extract::leaf_blocks;

/// Result of one decomposition: the complete project plus the per-asset
/// failures that were skipped without aborting
#[derive(Debug)]
pub struct Decomposition {
    pub project: Project,
    pub asset_errors: Vec<PipelineError>,
}

/// Parses a source EPUB into content units, image assets, and format
/// metadata.
///
/// Decomposition is atomic: a malformed document fails with `ParseError`
/// before anything is persisted. A single undecodable image is recorded as
/// an `AssetError` and skipped.
#[derive(Debug, Default)]
pub struct EpubDecomposer;

impl EpubDecomposer {
    pub fn new() -> Self {
        Self
    }

    /// Decompose `path` into a fully populated project
    pub fn decompose(&self, path: &Path) -> Result<Decomposition> {
        if path.extension().map(|e| e != "epub").unwrap_or(true) {
            return Err(PipelineError::ParseError {
                message: format!("{} is not an EPUB file", path.display()),
            });
        }

        let mut doc = EpubDoc::new(path).map_err(|e| PipelineError::ParseError {
            message: format!("{}: {}", path.display(), e),
        })?;

        let metadata = DocumentMetadata {
            title: doc.mdata("title"),
            author: doc.mdata("creator"),
            language: doc.mdata("language"),
            identifier: doc.mdata("identifier"),
        };

        let mut manifest_items = BTreeMap::new();
        for (id, (_res_path, mime)) in &doc.resources {
            manifest_items.insert(
                id.clone(),
                ManifestItem {
                    media_type: mime.clone(),
                    properties: None,
                },
            );
        }

        // Spine idrefs resolve to archive paths; a dangling idref means the
        // manifest is inconsistent and the whole decomposition fails
        let spine_ids = doc.spine.clone();
        let mut spine_order = Vec::with_capacity(spine_ids.len());
        for idref in &spine_ids {
            let (res_path, _) =
                doc.resources
                    .get(idref)
                    .ok_or_else(|| PipelineError::ParseError {
                        message: format!("spine references missing manifest entry '{}'", idref),
                    })?;
            spine_order.push(normalize_path(res_path));
        }

        let mut toc_structure = Vec::new();
        flatten_toc(&doc.toc, 1, &mut toc_structure);

        let mut asset_errors = Vec::new();

        let mut css_styles = BTreeMap::new();
        let css_ids: Vec<(String, String)> = doc
            .resources
            .iter()
            .filter(|(_, (_, mime))| mime == "text/css")
            .map(|(id, (p, _))| (id.clone(), normalize_path(p)))
            .collect();
        for (id, res_path) in css_ids {
            match doc.get_resource_str(&id) {
                Some((css, _)) => {
                    css_styles.insert(res_path, css);
                }
                None => {
                    warn!("stylesheet {} could not be read, skipping", res_path);
                    asset_errors.push(PipelineError::AssetError {
                        id: res_path,
                        message: "stylesheet could not be read".to_string(),
                    });
                }
            }
        }

        let mut images = BTreeMap::new();
        let image_ids: Vec<(String, String)> = doc
            .resources
            .iter()
            .filter(|(_, (_, mime))| mime.starts_with("image/"))
            .map(|(id, (p, _))| (id.clone(), normalize_path(p)))
            .collect();
        for (id, res_path) in image_ids {
            match doc.get_resource(&id) {
                Some((data, mime)) => {
                    let asset = ImageAsset {
                        image_id: res_path.clone(),
                        original_path: res_path.clone(),
                        base64_data: format!("data:{};base64,{}", mime, BASE64.encode(&data)),
                        mime_type: mime,
                        file_size: data.len(),
                    };
                    images.insert(res_path, asset);
                }
                None => {
                    warn!("image {} could not be decoded, skipping", res_path);
                    asset_errors.push(PipelineError::AssetError {
                        id: res_path,
                        message: "image payload could not be decoded".to_string(),
                    });
                }
            }
        }

        // Text extraction, strictly in spine order; sequence orders are
        // 1-based per chapter so ids stay stable across re-runs
        let mut units = BTreeMap::new();
        let mut seen_chapters = Vec::new();
        for (idref, chapter_id) in spine_ids.iter().zip(&spine_order) {
            if seen_chapters.contains(chapter_id) {
                warn!("chapter {} appears twice in the spine, skipping repeat", chapter_id);
                continue;
            }
            seen_chapters.push(chapter_id.clone());

            let (html, _) =
                doc.get_resource_str(idref)
                    .ok_or_else(|| PipelineError::ParseError {
                        message: format!("document {} is not readable text", chapter_id),
                    })?;

            let mut seq = 0u32;
            for leaf in leaf_blocks(&html) {
                seq += 1;
                let unit = ContentUnit::new(chapter_id.clone(), seq, leaf.text);
                units.insert(unit.content_id.clone(), unit);
            }
            debug!("chapter {}: {} unit(s)", chapter_id, seq);
        }

        let now = Utc::now();
        let project = Project {
            project_id: format!("epub_{}", now.format("%Y%m%d_%H%M%S")),
            original_file: path.to_path_buf(),
            status: ProjectStatus::Translating,
            created_at: now,
            updated_at: now,
            units,
            images,
            format: FormatInfo {
                metadata,
                css_styles,
                spine_order,
                toc_structure,
                manifest_items,
            },
        };

        info!(
            "decomposed {}: {} unit(s), {} image(s), {} chapter(s), {} asset error(s)",
            path.display(),
            project.units.len(),
            project.images.len(),
            project.format.spine_order.len(),
            asset_errors.len()
        );

        Ok(Decomposition {
            project,
            asset_errors,
        })
    }

    /// Preserve translation progress from an earlier mapping of the same
    /// book: units whose original text is unchanged keep their translation.
    pub fn carry_over_translations(&self, project: &mut Project, previous: &Project) {
        let mut by_text: BTreeMap<&str, &ContentUnit> = BTreeMap::new();
        for unit in previous.units.values() {
            if unit.is_translated() {
                by_text.insert(unit.original_text.as_str(), unit);
            }
        }
        let mut carried = 0usize;
        for unit in project.units.values_mut() {
            if let Some(old) = by_text.get(unit.original_text.as_str()) {
                unit.translated_text = old.translated_text.clone();
                unit.translated_at = old.translated_at;
                carried += 1;
            }
        }
        if carried > 0 {
            info!("carried over {} existing translation(s)", carried);
        }
    }
}

/// Stable chapter/asset key: archive-relative path with forward slashes
fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn flatten_toc(entries: &[NavPoint], level: u32, out: &mut Vec<TocEntry>) {
    for entry in entries {
        out.push(TocEntry {
            title: entry.label.clone(),
            href: Some(normalize_path(&entry.content)),
            level,
        });
        flatten_toc(&entry.children, level + 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn project_with(units: &[(&str, u32, &str, Option<&str>)]) -> Project {
        let mut map = BTreeMap::new();
        for (chapter, seq, text, translated) in units {
            let mut unit = ContentUnit::new(*chapter, *seq, *text);
            if let Some(t) = translated {
                unit.translated_text = Some(t.to_string());
                unit.translated_at = Some(Utc::now());
            }
            map.insert(unit.content_id.clone(), unit);
        }
        Project {
            project_id: "p".to_string(),
            original_file: PathBuf::from("b.epub"),
            status: ProjectStatus::Translating,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            units: map,
            images: BTreeMap::new(),
            format: FormatInfo::default(),
        }
    }

    #[test]
    fn test_carry_over_matches_on_original_text() {
        let previous = project_with(&[
            ("ch1.xhtml", 1, "Hello", Some("你好")),
            ("ch1.xhtml", 2, "Unchanged", Some("未变")),
        ]);
        // Re-import shifted positions: text is what matters, not ids
        let mut fresh = project_with(&[
            ("ch1.xhtml", 1, "A new opening", None),
            ("ch1.xhtml", 2, "Hello", None),
            ("ch1.xhtml", 3, "Unchanged", None),
        ]);

        EpubDecomposer::new().carry_over_translations(&mut fresh, &previous);

        assert_eq!(
            fresh.units["ch1.xhtml#000002"].translated_text.as_deref(),
            Some("你好")
        );
        assert_eq!(
            fresh.units["ch1.xhtml#000003"].translated_text.as_deref(),
            Some("未变")
        );
        assert!(fresh.units["ch1.xhtml#000001"].translated_text.is_none());
        // Carried units keep the text/timestamp invariant
        assert!(fresh.units["ch1.xhtml#000002"].translated_at.is_some());
    }

    #[test]
    fn test_non_epub_path_rejected() {
        let err = EpubDecomposer::new()
            .decompose(Path::new("/tmp/book.pdf"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::ParseError { .. }));
    }
}
