use anyhow::Context;
use clap::Parser;
use picvec::cli::{Cli, Commands};
use picvec::{ClipEmbedder, Config, FileWatcher, Gallery, UploadFile};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("picvec=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::new(cli.base_dir.clone())?;

    match cli.command {
        Commands::Init => handle_init(config),
        Commands::Index { force } => handle_index(config, force),
        Commands::Upload { files } => handle_upload(config, &files),
        Commands::Search { query, limit } => handle_search(config, &query, limit),
        Commands::Status => handle_status(config),
        Commands::Compact => handle_compact(config),
        Commands::Watch => handle_watch(config),
    }
}

/// Open the gallery, requiring `picvec init` to have run
fn open_gallery(config: Config) -> anyhow::Result<Gallery> {
    if !config.is_initialized() {
        anyhow::bail!("picvec is not initialized. Run 'picvec init' first.");
    }
    let embedder = ClipEmbedder::init(&config).context("Failed to load embedding model")?;
    Ok(Gallery::open(config, Arc::new(embedder))?)
}

fn handle_init(config: Config) -> anyhow::Result<()> {
    println!("Initializing picvec...");

    if config.is_initialized() {
        println!("picvec is already initialized at: {:?}", config.base_dir);
        return Ok(());
    }

    config.init()?;
    println!("✓ Created image directory: {:?}", config.images_dir);
    println!("✓ Created index directory: {:?}", config.index_dir);
    println!("✓ Created models directory: {:?}", config.models_dir);

    ClipEmbedder::init(&config).context("Failed to download embedding model")?;
    println!("✓ Embedding model ready");

    println!("\nInitialization complete!");
    println!("Next steps:");
    println!("  1. Add images: picvec upload photo.jpg ...");
    println!("  2. Search them: picvec search \"a dog on the beach\"");
    Ok(())
}

fn handle_index(config: Config, force: bool) -> anyhow::Result<()> {
    let gallery = open_gallery(config.without_auto_index())?;

    if force {
        println!("Rebuilding index...");
        let report = gallery.rebuild()?;
        println!("\nIndexing complete!");
        println!("  Embedded: {} images", report.embedded_count());
        println!("  Reused from cache: {}", report.reused_count());
        for (path, reason) in report.failures() {
            println!("  ✗ {}: {}", path.display(), reason);
        }
    }

    let status = gallery.status();
    if let Some(error) = &status.last_error {
        anyhow::bail!("Indexing failed: {}", error);
    }
    println!(
        "Index up to date ({} of {} images processed in the last run)",
        status.processed_images, status.total_images
    );
    Ok(())
}

fn handle_upload(config: Config, files: &[PathBuf]) -> anyhow::Result<()> {
    let gallery = open_gallery(config.without_auto_index())?;

    let mut uploads = Vec::with_capacity(files.len());
    for path in files {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        uploads.push(UploadFile::new(name, bytes));
    }

    let report = gallery.upload(uploads)?;
    for path in &report.uploaded {
        println!("  ✓ {}", path.display());
    }
    for skipped in &report.skipped {
        println!("  - {} ({:?})", skipped.name, skipped.reason);
    }

    if !report.uploaded.is_empty() {
        gallery.start_indexing(true);
        let status = gallery.status();
        println!("Indexed {} of {} images", status.processed_images, status.total_images);
    }
    Ok(())
}

fn handle_search(config: Config, query: &str, limit: Option<usize>) -> anyhow::Result<()> {
    let top_k = limit.unwrap_or(config.default_top_k);
    let gallery = open_gallery(config)?;

    let results = gallery.search(query, top_k);
    if results.images.is_empty() {
        println!("No results found.");
    } else {
        for (i, path) in results.images.iter().enumerate() {
            println!("{}. {}", i + 1, path);
        }
    }
    Ok(())
}

fn handle_status(config: Config) -> anyhow::Result<()> {
    let gallery = open_gallery(config.without_auto_index())?;
    println!("{}", serde_json::to_string_pretty(&gallery.status())?);
    Ok(())
}

fn handle_compact(config: Config) -> anyhow::Result<()> {
    let gallery = open_gallery(config.without_auto_index())?;
    let removed = gallery.compact()?;
    println!("Removed {} stale entries", removed);
    Ok(())
}

fn handle_watch(config: Config) -> anyhow::Result<()> {
    let gallery = open_gallery(config)?;
    println!("Watching {} (Ctrl+C to stop)", gallery.config().images_dir.display());
    FileWatcher::new(gallery).watch()?;
    Ok(())
}
