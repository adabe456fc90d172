//! Main entry point for the EPUB translator CLI

#![forbid(unsafe_code)]

use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use epub_translator::cli::commands::{self, Commands};

/// EPUB translator - batch translation pipeline for EPUB books
#[derive(Parser, Debug)]
#[command(name = "epub-translator", version, about, long_about = None)]
struct Args {
    /// API key for the translation backend (defaults to TRANSLATE_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("epub_translator={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Override config with CLI args if provided
    if let Some(api_key) = args.api_key {
        std::env::set_var("TRANSLATE_API_KEY", api_key);
    }

    // Execute command
    match args.command {
        Some(Commands::Import { file, mapping_dir }) => {
            commands::handle_import(file, mapping_dir).await?;
        }
        Some(Commands::Translate {
            mapping_dir,
            config,
            target_lang,
            glossary,
            max_concurrent,
            max_rps,
        }) => {
            commands::handle_translate(
                mapping_dir,
                config,
                target_lang,
                glossary,
                max_concurrent,
                max_rps,
            )
            .await?;
        }
        Some(Commands::Export {
            mapping_dir,
            output,
            partial,
        }) => {
            commands::handle_export(mapping_dir, output, partial).await?;
        }
        Some(Commands::Status { mapping_dir }) => {
            commands::handle_status(mapping_dir).await?;
        }
        None => {
            println!("Please specify a command. Use --help for more information.");
        }
    }

    Ok(())
}
