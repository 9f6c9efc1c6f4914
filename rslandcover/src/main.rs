use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use rslandcover::classification::export::{
    Destination, ExportOutcome, FolderStorage, RemoteStorage,
};
use rslandcover::collect::catalog::LocalCatalog;
use rslandcover::collect::global_variables::get_temp_path;
use rslandcover::commons::thumbnail::{convert_folder, ThumbnailOptions};
use rslandcover::synthetic::{demo_catalog, SyntheticOptions};
use rslandcover::{Pipeline, PipelineConfig, PipelineReport};

/// Supervised land-cover classification of multispectral scenes
#[derive(Parser)]
#[command(name = "rslandcover")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Scene selection, sampling, CART classification and GeoTIFF export", long_about = None)]
struct Cli {
    /// Log filter when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the classification pipeline on a catalog
    Classify {
        /// Catalog manifest (catalog.json)
        #[arg(long)]
        catalog: PathBuf,
        /// Pipeline configuration (JSON); defaults are used when absent
        #[arg(long)]
        config: Option<PathBuf>,
        /// Root folder of the remote storage backend
        #[arg(long)]
        remote_root: Option<PathBuf>,
        /// Block until a remote export job has finished
        #[arg(long)]
        wait: bool,
    },
    /// Render JPEG previews for the GeoTIFFs of a folder
    Thumbnails {
        dir: PathBuf,
        #[arg(long, default_value_t = 1024)]
        max_dimension: u32,
        #[arg(long, default_value_t = 95)]
        quality: u8,
    },
    /// Write the default pipeline configuration
    InitConfig { path: PathBuf },
    /// Write a synthetic catalog, optionally classifying it
    Demo {
        /// Output folder, ./temp/demo by default
        out_dir: Option<PathBuf>,
        /// Also run the pipeline with outputs under <out_dir>/data
        #[arg(long)]
        run: bool,
    },
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)?,
    };
    if json {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

fn print_report(report: &PipelineReport, wait: bool) -> Result<()> {
    println!("Scene: {} ({})", report.scene_id, report.scene_date);
    if let Some(cloud) = report.cloud_cover {
        println!("Cloud cover: {:.2}", cloud);
    }
    println!(
        "Samples: {}, training records: {}",
        report.sample_count, report.training_count
    );
    println!(
        "Decision tree: depth {}, {} leaves",
        report.tree_depth, report.tree_leaves
    );
    for class in report.taxonomy.classes() {
        println!("  {:>3}  {}  {}", class.code, class.color, class.name);
    }
    match &report.outcome {
        ExportOutcome::Local(artifact) => println!(
            "Exported {} ({}x{} at {} m)",
            artifact.path.display(),
            artifact.width,
            artifact.height,
            artifact.scale
        ),
        ExportOutcome::Remote(job) if wait => {
            let artifact = job
                .wait(Duration::from_millis(200))
                .context(format!("Export job {} failed", job.id()))?;
            println!("Export job {} finished: {}", job.id(), artifact.path.display());
        }
        ExportOutcome::Remote(job) => {
            println!("Export job {} submitted ({})", job.id(), job.poll())
        }
    }
    if let Some(thumbnails) = &report.thumbnails {
        println!(
            "Previews: {} generated, {} skipped, {} failed",
            thumbnails.generated.len(),
            thumbnails.skipped.len(),
            thumbnails.failed.len()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json_logs)?;

    match cli.command {
        Commands::Classify {
            catalog,
            config,
            remote_root,
            wait,
        } => {
            let config = match config {
                Some(path) => PipelineConfig::from_json_file(&path)
                    .context(format!("Failed to load configuration {:?}", path))?,
                None => PipelineConfig::default(),
            };
            let local = LocalCatalog::open(&catalog)
                .context(format!("Failed to open catalog {:?}", catalog))?;
            let storage = remote_root.as_deref().map(FolderStorage::new);
            let report = Pipeline::new(config)
                .run(
                    &local,
                    &local,
                    storage.as_ref().map(|s| s as &dyn RemoteStorage),
                )
                .context("Classification pipeline failed")?;
            print_report(&report, wait)?;
        }
        Commands::Thumbnails {
            dir,
            max_dimension,
            quality,
        } => {
            let options = ThumbnailOptions {
                max_dimension,
                quality,
            };
            let report = convert_folder(&dir, &options)
                .context(format!("Failed to scan {:?}", dir))?;
            println!(
                "Previews: {} generated, {} skipped, {} failed",
                report.generated.len(),
                report.skipped.len(),
                report.failed.len()
            );
        }
        Commands::InitConfig { path } => {
            PipelineConfig::default()
                .to_json_file(&path)
                .context(format!("Failed to write {:?}", path))?;
            println!("Default configuration written to {}", path.display());
        }
        Commands::Demo { out_dir, run } => {
            let out_dir = out_dir.unwrap_or_else(|| get_temp_path().join("demo"));
            let catalog = demo_catalog(&SyntheticOptions::default())
                .context("Failed to build synthetic catalog")?;
            let manifest = catalog
                .save(&out_dir)
                .context(format!("Failed to save catalog to {:?}", out_dir))?;
            println!("Synthetic catalog written to {}", manifest.display());

            if run {
                let mut config = PipelineConfig::default();
                config.destination = Destination::LocalFile {
                    path: out_dir.join("data").join("landcover.tif"),
                };
                let reopened = LocalCatalog::open(&manifest)
                    .context(format!("Failed to open catalog {:?}", manifest))?;
                let report = Pipeline::new(config)
                    .run(&reopened, &reopened, None)
                    .context("Classification pipeline failed")?;
                print_report(&report, false)?;
            }
        }
    }
    Ok(())
}
