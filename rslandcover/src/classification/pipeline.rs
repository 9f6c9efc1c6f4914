use std::path::Path;
use tracing::{info, warn};

use crate::classification::cart::{classify, ClassifiedRaster, DecisionTree};
use crate::classification::export::{export, package, Destination, ExportOutcome, RemoteStorage};
use crate::classification::reference::{load_reference_layer, Taxonomy};
use crate::classification::sampler::draw_samples;
use crate::classification::scene::select_scene;
use crate::classification::training::build_training_set;
use crate::collect::catalog::{ReferenceStore, SceneCatalog};
use crate::commons::thumbnail::{convert_folder, ThumbnailReport};
use crate::config::PipelineConfig;
use crate::error::Result;

/// What a pipeline run produced
#[derive(Debug)]
pub struct PipelineReport {
    pub scene_id: String,
    pub scene_date: String,
    pub cloud_cover: Option<f64>,
    pub sample_count: usize,
    pub training_count: usize,
    pub tree_depth: usize,
    pub tree_leaves: usize,
    pub taxonomy: Taxonomy,
    pub classified: ClassifiedRaster,
    pub outcome: ExportOutcome,
    /// Only for local exports with thumbnails enabled
    pub thumbnails: Option<ThumbnailReport>,
}

/// Supervised classification run, stages strictly in sequence
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Pipeline { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Select, sample, train, classify, package and export
    ///
    /// The first error aborts the run. Thumbnail failures do not: they are
    /// recorded in the report.
    pub fn run(
        &self,
        catalog: &dyn SceneCatalog,
        references: &dyn ReferenceStore,
        storage: Option<&dyn RemoteStorage>,
    ) -> Result<PipelineReport> {
        let cfg = &self.config;
        cfg.validate()?;
        let dates = cfg.date_range()?;

        let scene = select_scene(
            catalog,
            &cfg.collection,
            &cfg.region,
            &dates,
            &cfg.quality_property,
            &cfg.band_pattern,
        )?;
        let cloud_cover = scene.quality(&cfg.quality_property);
        info!(date = %scene.date_string(), "image date");
        info!(cloud_cover = ?cloud_cover, "image {}", cfg.quality_property);

        let footprint = scene.footprint();
        let (reference, taxonomy) =
            load_reference_layer(references, &cfg.reference_layer, &cfg.label_band, &footprint)?;

        let samples = draw_samples(
            &reference,
            &footprint,
            cfg.sampling.count,
            cfg.sampling.scale,
            cfg.sampling.seed,
            cfg.sampling.with_geometry,
        )?;
        info!(size = samples.len(), "points size");
        if let Some(first) = samples.first() {
            info!(
                label = first.label,
                location = ?first.location.map(|p| (p.x(), p.y())),
                "points first"
            );
        }

        let training = build_training_set(&scene, &cfg.bands, &samples, cfg.sampling.scale)?;
        if let Some(path) = &cfg.training_csv {
            training.write_csv(path)?;
            info!(path = %path.display(), "training records written");
        }
        let model = DecisionTree::train(&training, &samples.label_field, &cfg.bands)?;
        if let Some(first) = training.first() {
            info!(label = first.label, values = ?first.values, "training data first");
        }

        let classified = classify(&model, &scene, &cfg.bands)?;

        let codes = taxonomy.codes();
        let palette: Vec<String> = taxonomy.classes().iter().map(|c| c.color.to_hex()).collect();
        let names: Vec<&str> = taxonomy.classes().iter().map(|c| c.name.as_str()).collect();
        info!(palette = ?palette, "class palette");
        info!(values = ?codes, "class values");
        info!(names = ?names, "class names");

        let classified = package(classified, &taxonomy);
        let outcome = export(&classified, &cfg.destination, cfg.export_scale, storage)?;

        let thumbnails = match (&cfg.destination, cfg.thumbnails) {
            (Destination::LocalFile { path }, true) => {
                let folder = path.parent().filter(|p| !p.as_os_str().is_empty());
                let report = convert_folder(folder.unwrap_or(Path::new(".")), &cfg.thumbnail_options)?;
                if !report.failed.is_empty() {
                    warn!(failed = report.failed.len(), "some previews could not be generated");
                }
                Some(report)
            }
            _ => None,
        };

        Ok(PipelineReport {
            scene_id: scene.id().to_string(),
            scene_date: scene.date_string(),
            cloud_cover,
            sample_count: samples.len(),
            training_count: training.len(),
            tree_depth: model.depth(),
            tree_leaves: model.leaf_count(),
            taxonomy,
            classified,
            outcome,
            thumbnails,
        })
    }
}
