//! # Batch Image Converter - Main Entry Point
//!
//! ## Responsabilità:
//! - Parsing degli argomenti della command line con `clap`
//! - Caricamento del file di configurazione e override dei flag CLI
//! - Inizializzazione del sistema di logging con `tracing`
//! - Avvio del `BatchConverter`
//!
//! ## Esempio di utilizzo:
//! ```bash
//! image-converter ./photos --format webp --quality 85 --workers 8 --output ./converted
//! ```

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use batch_image_converter::{BatchConverter, Config, MetadataPolicy};

#[derive(Parser)]
#[command(name = "image-converter")]
#[command(about = "Convert image collections between formats, with caching and resume")]
struct Args {
    /// Image file or directory to convert
    input: PathBuf,

    /// Target format (png, jpg, jpeg, webp, tiff, gif, avif, heif)
    #[arg(short, long)]
    format: Option<String>,

    /// Encoder quality (1-100)
    #[arg(short, long)]
    quality: Option<u8>,

    /// Downscale so the longer side is at most this many pixels
    #[arg(long)]
    max_dimension: Option<u32>,

    /// Metadata handling
    #[arg(long, value_enum)]
    metadata: Option<MetadataPolicy>,

    /// Keep the original files after conversion
    #[arg(short, long)]
    keep_original: bool,

    /// Dry run - report what would be converted without touching files
    #[arg(long)]
    dry_run: bool,

    /// Copy each original into a sibling backup/ directory first
    #[arg(short, long)]
    backup: bool,

    /// Only convert files directly inside the input directory
    #[arg(long)]
    no_recursive: bool,

    /// Maximum directory depth (0 = unlimited)
    #[arg(long)]
    max_depth: Option<usize>,

    /// Output directory (if not specified, write beside the originals)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Put every output directly in the output directory
    #[arg(long)]
    flatten: bool,

    /// Recreate empty source directories in the output directory
    #[arg(long)]
    keep_empty_dirs: bool,

    /// Follow symbolic links while scanning
    #[arg(long)]
    follow_symlinks: bool,

    /// Per-folder breakdown in the final report
    #[arg(long)]
    group_by_folder: bool,

    /// Number of parallel workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Maximum conversions started per second (0 = unlimited)
    #[arg(long)]
    rate_limit: Option<u32>,

    /// Do not load or save the conversion cache
    #[arg(long)]
    no_cache: bool,

    /// Do not resume or record interrupted sessions
    #[arg(long)]
    no_resume: bool,

    /// Configuration file (default: ~/.batch-convert/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective configuration back to the configuration file
    #[arg(long)]
    save_config: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Apply command line overrides on top of the file configuration.
    fn merge_into(&self, mut config: Config) -> Config {
        if let Some(ref format) = self.format {
            config.default_format = format.to_lowercase();
        }
        if let Some(quality) = self.quality {
            config.quality = quality;
        }
        if let Some(max_dimension) = self.max_dimension {
            config.max_dimension = max_dimension;
        }
        if let Some(metadata) = self.metadata {
            config.metadata = metadata;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(rate_limit) = self.rate_limit {
            config.rate_limit = rate_limit;
        }
        config.auto_backup |= self.backup;
        config.keep_original = self.keep_original;
        config.dry_run = self.dry_run;
        if self.no_cache {
            config.cache_enabled = false;
        }
        if self.no_resume {
            config.resume_enabled = false;
        }

        let batch = &mut config.batch_processing;
        if self.no_recursive {
            batch.recursive_search = false;
        }
        if let Some(max_depth) = self.max_depth {
            batch.max_depth = max_depth;
        }
        if let Some(ref output) = self.output {
            batch.output_dir = Some(output.clone());
        }
        if self.flatten {
            batch.preserve_structure = false;
        }
        if self.keep_empty_dirs {
            batch.skip_empty_dirs = false;
        }
        batch.follow_symlinks |= self.follow_symlinks;
        batch.group_by_folder |= self.group_by_folder;
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match args.config {
        Some(ref path) => path.clone(),
        None => Config::default_path()?,
    };
    let config = args.merge_into(Config::from_file(&config_path).await?);
    config.validate()?;

    // Initialize logging: RUST_LOG wins, then --verbose, then the configured level
    let level = if args.verbose { "debug" } else { config.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if args.save_config {
        config.save_to_file(&config_path).await?;
        info!("Configuration saved to {}", config_path.display());
    }

    if !args.input.exists() {
        return Err(anyhow::anyhow!("Input path does not exist: {}", args.input.display()));
    }

    let target_format = config.default_format.clone();
    let converter = BatchConverter::new(&args.input, &target_format, config)?;
    let outcome = converter.run().await?;

    if outcome.halted {
        return Err(anyhow::anyhow!(
            "conversion halted after {} files; run the same command again to resume",
            outcome.statistics.total_files
        ));
    }
    Ok(())
}
