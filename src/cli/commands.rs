//! CLI command definitions and handlers

use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::core::cache::CacheProvider;
use crate::core::client::HttpTranslator;
use crate::core::config::TranslatorConfig;
use crate::core::errors::PipelineError;
use crate::core::models::Glossary;
use crate::core::rate_limit::RateLimiter;
use crate::core::scheduler::{BatchOptions, BatchScheduler, CancelToken};
use crate::core::store::MappingStore;
use crate::processors::decomposer::EpubDecomposer;
use crate::processors::reassembler::Reassembler;

/// Commands for the EPUB translation pipeline
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Decompose an EPUB (or a directory of EPUBs) into a mapping
    Import {
        /// Input file or directory (required)
        #[arg(short, long)]
        file: PathBuf,

        /// Mapping directory (default: mapping/<book name> beside the input)
        #[arg(short, long)]
        mapping_dir: Option<PathBuf>,
    },

    /// Translate all pending units of one mapping, or of every mapping
    /// under a parent directory
    Translate {
        /// Mapping directory created by `import`, or a directory of mappings
        #[arg(short, long)]
        mapping_dir: PathBuf,

        /// JSON config file (replaces env-derived settings)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Target language (default: from config/env)
        #[arg(short, long)]
        target_lang: Option<String>,

        /// Glossary YAML file
        #[arg(short, long)]
        glossary: Option<PathBuf>,

        /// Maximum concurrent workers
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Maximum backend calls per second
        #[arg(long)]
        max_rps: Option<f64>,
    },

    /// Reassemble the translated EPUB from a mapping
    Export {
        /// Mapping directory created by `import`
        #[arg(short, long)]
        mapping_dir: PathBuf,

        /// Output EPUB path
        #[arg(short, long)]
        output: PathBuf,

        /// Fall back to original text for untranslated units
        #[arg(long)]
        partial: bool,
    },

    /// Show mapping status and translation progress
    Status {
        /// Mapping directory created by `import`
        #[arg(short, long)]
        mapping_dir: PathBuf,
    },
}

/// Default mapping directory: mapping/<book name> beside the source file
fn default_mapping_dir(file: &Path) -> PathBuf {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "book".to_string());
    file.parent()
        .unwrap_or_else(|| Path::new("."))
        .join("mapping")
        .join(stem)
}

/// Find EPUB files in a directory
fn find_epub_files(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| p.is_file() && p.extension().map(|e| e == "epub").unwrap_or(false))
        .collect()
}

/// Handle the import command
pub async fn handle_import(file: PathBuf, mapping_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let files = if file.is_dir() {
        find_epub_files(&file)
    } else {
        vec![file]
    };
    if files.is_empty() {
        anyhow::bail!("No EPUB files found");
    }

    let decomposer = EpubDecomposer::new();
    for path in files {
        let dir = mapping_dir
            .clone()
            .unwrap_or_else(|| default_mapping_dir(&path));
        info!("importing {} -> {}", path.display(), dir.display());

        let mut decomposition = decomposer.decompose(&path)?;

        // Keep translation progress from an earlier import of the same book
        match MappingStore::open(&dir) {
            Ok(previous) => {
                decomposer
                    .carry_over_translations(&mut decomposition.project, &previous.project());
            }
            Err(PipelineError::NotFoundError { .. }) => {}
            Err(e) => {
                warn!("existing mapping at {} is unusable: {}", dir.display(), e);
            }
        }

        let unit_count = decomposition.project.units.len();
        let image_count = decomposition.project.images.len();
        let chapter_count = decomposition.project.format.spine_order.len();
        MappingStore::create(&dir, decomposition.project)?;

        println!("\n✅ Imported {}", path.display());
        println!("   Chapters: {}", chapter_count);
        println!("   Units: {}", unit_count);
        println!("   Images: {}", image_count);
        for err in &decomposition.asset_errors {
            println!("   ⚠️  {}", err);
        }
        println!("   Mapping: {}", dir.display());
    }

    Ok(())
}

/// A single mapping dir, or every mapping one level below a parent dir
fn find_mapping_dirs(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if MappingStore::exists(dir) {
        return Ok(vec![dir.to_path_buf()]);
    }
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && MappingStore::exists(p))
        .collect();
    dirs.sort();
    if dirs.is_empty() {
        anyhow::bail!("no mapping found at {}", dir.display());
    }
    Ok(dirs)
}

/// Handle the translate command
pub async fn handle_translate(
    mapping_dir: PathBuf,
    config_file: Option<PathBuf>,
    target_lang: Option<String>,
    glossary: Option<PathBuf>,
    max_concurrent: Option<usize>,
    max_rps: Option<f64>,
) -> anyhow::Result<()> {
    let mut config = match config_file {
        Some(path) => TranslatorConfig::from_file(path)?,
        None => TranslatorConfig::from_env()?,
    };
    if let Some(lang) = target_lang {
        config.target_lang = lang;
    }
    if let Some(n) = max_concurrent {
        config.max_concurrent = n;
    }
    if let Some(r) = max_rps {
        config.max_rps = r;
    }
    config.validate()?;

    let glossary = match glossary {
        Some(path) => Glossary::from_file(&path)?,
        None => Glossary::empty(),
    };

    let backend = Arc::new(HttpTranslator::new(&config)?);
    let limiter = Arc::new(RateLimiter::new(config.max_rps));
    // Scope decides whether mappings share one cache or get one each
    let provider = CacheProvider::new(config.cache_scope);

    // Ctrl-C cancels the current batch and skips the remaining mappings;
    // persisted translations stay valid
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("cancellation requested");
                cancel.cancel();
            }
        });
    }

    for dir in find_mapping_dirs(&mapping_dir)? {
        if cancel.is_cancelled() {
            break;
        }

        let store = Arc::new(MappingStore::open(&dir)?);
        let cache = provider.cache();
        let scheduler =
            BatchScheduler::new(backend.clone(), cache.clone(), store.clone(), limiter.clone());

        let pending = store.pending_units().len();
        info!(
            "translating {} pending unit(s) in {} to {}",
            pending,
            dir.display(),
            config.target_lang
        );

        let pb = ProgressBar::new(pending as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .unwrap()
                .progress_chars("=>-"),
        );

        // Pull progress from the scheduler's status channel
        let mut progress_rx = scheduler.progress();
        let pb_task = {
            let pb = pb.clone();
            tokio::spawn(async move {
                while progress_rx.changed().await.is_ok() {
                    let p = *progress_rx.borrow();
                    pb.set_position((p.completed + p.failed) as u64);
                }
            })
        };

        let options = BatchOptions {
            target_lang: config.target_lang.clone(),
            glossary: glossary.clone(),
            concurrency: config.max_concurrent,
            retry: config.retry_policy(),
        };
        let summary = scheduler.run(options, cancel.clone()).await?;
        pb_task.abort();
        pb.finish_with_message(if summary.cancelled { "Cancelled" } else { "Completed" });

        let stats = cache.stats();
        println!(
            "\n{} Translation {} for {}",
            if summary.cancelled { "🛑" } else { "✅" },
            if summary.cancelled { "cancelled" } else { "completed" },
            dir.display()
        );
        println!("   Translated: {}", summary.succeeded);
        println!("   Cache hits: {}", summary.cache_hits);
        println!("   Failed: {}", summary.failed.len());
        println!(
            "   Cache: {} entries, {} hits / {} misses",
            stats.entries, stats.hits, stats.misses
        );
        for failure in &summary.failed {
            println!(
                "   ❌ {} [{}]: {}",
                failure.content_id, failure.kind, failure.message
            );
        }
    }

    Ok(())
}

/// Handle the export command
pub async fn handle_export(
    mapping_dir: PathBuf,
    output: PathBuf,
    partial: bool,
) -> anyhow::Result<()> {
    let store = MappingStore::open(&mapping_dir)?;
    let written = Reassembler::new().export(&store, &output, partial)?;
    println!("✅ Exported {}", written.display());
    Ok(())
}

/// Handle the status command
pub async fn handle_status(mapping_dir: PathBuf) -> anyhow::Result<()> {
    let store = MappingStore::open(&mapping_dir)?;
    let project = store.project();
    let pending = store.pending_units().len();
    let total = project.units.len();

    println!("Project: {}", project.project_id);
    println!("   Source: {}", project.original_file.display());
    println!("   Status: {}", project.status);
    println!("   Units: {} translated / {} total", total - pending, total);
    println!("   Images: {}", project.images.len());
    println!("   Updated: {}", project.updated_at);
    if pending > 0 {
        println!("   Pending: {}", pending);
    }
    Ok(())
}
