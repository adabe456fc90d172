//! Output document reassembly from a translated mapping

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::core::errors::{PipelineError, Result};
use crate::core::models::{ContentUnit, ProjectStatus};
use crate::core::store::MappingStore;
use crate::processors::extract::substitute_blocks;

/// Rebuilds the output EPUB from the mapping: translated text substituted in
/// place, every other archive entry copied byte-for-byte.
#[derive(Debug, Default)]
pub struct Reassembler;

impl Reassembler {
    pub fn new() -> Self {
        Self
    }

    /// Export the translated document to `output`.
    ///
    /// Fails with `IncompleteTranslationError` while units are unresolved,
    /// unless `partial` is set, in which case those units keep their
    /// original text. The output is written to a temp file and renamed into
    /// place, so a failure mid-export never leaves a partial file behind.
    pub fn export(&self, store: &MappingStore, output: &Path, partial: bool) -> Result<PathBuf> {
        let project = store.project();

        if !partial {
            let missing = project.pending_unit_ids();
            if !missing.is_empty() {
                return Err(PipelineError::IncompleteTranslationError { missing });
            }
        }

        if !project.original_file.exists() {
            return Err(PipelineError::NotFoundError {
                path: project.original_file.display().to_string(),
            });
        }

        // Units grouped per chapter, ordered by sequence
        let mut by_chapter: BTreeMap<&str, Vec<&ContentUnit>> = BTreeMap::new();
        for unit in project.units.values() {
            by_chapter.entry(&unit.chapter_id).or_default().push(unit);
        }
        for units in by_chapter.values_mut() {
            units.sort_by_key(|u| u.sequence_order);
        }
        let chapters: HashSet<&str> = project
            .format
            .spine_order
            .iter()
            .map(String::as_str)
            .collect();

        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = output.with_extension("epub.tmp");

        let result = self.write_archive(&project.original_file, &tmp, &chapters, &by_chapter);
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }

        fs::rename(&tmp, output)?;
        store.set_status(ProjectStatus::Exported)?;

        info!("exported {}", output.display());
        Ok(output.to_path_buf())
    }

    fn write_archive(
        &self,
        source: &Path,
        tmp: &Path,
        chapters: &HashSet<&str>,
        by_chapter: &BTreeMap<&str, Vec<&ContentUnit>>,
    ) -> Result<()> {
        let mut archive = ZipArchive::new(File::open(source)?)?;
        let mut writer = ZipWriter::new(File::create(tmp)?);

        for index in 0..archive.len() {
            let name = archive.by_index_raw(index)?.name().to_string();

            if chapters.contains(name.as_str()) {
                let mut entry = archive.by_index(index)?;
                let mut html = String::new();
                entry
                    .read_to_string(&mut html)
                    .map_err(|e| PipelineError::ParseError {
                        message: format!("document {} is not readable text: {}", name, e),
                    })?;
                drop(entry);

                let units = by_chapter.get(name.as_str()).map(Vec::as_slice).unwrap_or(&[]);
                let translations: Vec<Option<String>> = units
                    .iter()
                    .map(|u| u.translated_text.clone())
                    .collect();
                let rewritten = substitute_blocks(&html, &translations).map_err(|e| {
                    PipelineError::CorruptionError {
                        message: format!("chapter {}: {}", name, e),
                    }
                })?;

                debug!("substituted {} block(s) in {}", translations.len(), name);
                writer.start_file(
                    name,
                    FileOptions::default().compression_method(CompressionMethod::Deflated),
                )?;
                writer.write_all(rewritten.as_bytes())?;
            } else {
                // Byte-identical copy, compression and all; this covers the
                // mimetype entry, manifest, TOC, stylesheets, and images
                let entry = archive.by_index_raw(index)?;
                writer.raw_copy_file(entry)?;
            }
        }

        writer.finish()?;
        Ok(())
    }
}
