use anyhow::{Context, Result};
use std::path::PathBuf;

use rslandcover::classification::cart::{classify, DecisionTree};
use rslandcover::classification::export::{export, package, read_exported, Destination, ExportOutcome};
use rslandcover::classification::reference::load_reference_layer;
use rslandcover::classification::sampler::draw_samples;
use rslandcover::classification::scene::select_scene;
use rslandcover::classification::training::build_training_set;
use rslandcover::collect::global_variables::get_temp_path;
use rslandcover::synthetic::{demo_catalog, SyntheticOptions};
use rslandcover::PipelineConfig;

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    println!("=== Supervised land-cover classification, stage by stage ===\n");
    let config = PipelineConfig::default();
    let catalog = demo_catalog(&SyntheticOptions::default()).context("Failed to build demo data")?;

    // 1. Scene selection
    let scene = select_scene(
        &catalog,
        &config.collection,
        &config.region,
        &config.date_range()?,
        &config.quality_property,
        &config.band_pattern,
    )?;
    println!("1. Scene {} acquired {}", scene.id(), scene.date_string());
    println!("   cloud cover: {:?}", scene.quality(&config.quality_property));
    println!("   bands: {:?}", scene.band_names());

    // 2. Reference layer and taxonomy
    let footprint = scene.footprint();
    let (reference, taxonomy) =
        load_reference_layer(&catalog, &config.reference_layer, &config.label_band, &footprint)?;
    println!("\n2. Reference '{}' with {} classes", reference.id, taxonomy.len());

    // 3. Samples
    let samples = draw_samples(&reference, &footprint, 5000, 30.0, 0, true)?;
    println!("\n3. {} samples drawn", samples.len());
    if let Some(first) = samples.first() {
        println!("   first: {:?}", first);
    }

    // 4. Training set
    let training = build_training_set(&scene, &config.bands, &samples, 30.0)?;
    println!("\n4. {} training records", training.len());

    // 5. Train and classify
    let model = DecisionTree::train(&training, "landcover", &config.bands)?;
    println!("\n5. Tree depth {}, {} leaves", model.depth(), model.leaf_count());
    let classified = classify(&model, &scene, &config.bands)?;
    println!("   classes found: {:?}", classified.distinct_codes());

    // 6. Package and export
    let out: PathBuf = get_temp_path().join("example").join("landcover.tif");
    let packaged = package(classified, &taxonomy);
    if let ExportOutcome::Local(artifact) =
        export(&packaged, &Destination::LocalFile { path: out.clone() }, 900.0, None)?
    {
        println!(
            "\n6. Exported {} ({}x{})",
            artifact.path.display(),
            artifact.width,
            artifact.height
        );
    }
    let (_, legend) = read_exported(&out)?;
    for class in legend.classes() {
        println!("   {:>3} {} {}", class.code, class.color, class.name);
    }

    Ok(())
}
