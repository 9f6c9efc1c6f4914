use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classification::cart::ClassifiedRaster;
use crate::classification::reference::Taxonomy;
use crate::error::{ClassificationError, Result};
use crate::geo_core::{is_geographic, Region, EPSG_WGS84};
use crate::raster::{geotiff, Raster};

/// Property prefix of the taxonomy attached to classified rasters
pub const CLASSIFICATION_PREFIX: &str = "classification";

/// Attach the taxonomy as raster-level properties
///
/// Writes `classification_class_values`, `classification_class_names` and
/// `classification_class_palette`; pixel values are untouched.
pub fn package(classified: ClassifiedRaster, taxonomy: &Taxonomy) -> ClassifiedRaster {
    let mut classified = classified;
    for (key, value) in taxonomy.to_properties(CLASSIFICATION_PREFIX) {
        classified.raster_mut().set_property(&key, value);
    }
    classified
}

/// Where a classified raster is exported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    /// GeoTIFF written synchronously
    LocalFile { path: PathBuf },
    /// Asynchronous job on a remote storage backend
    RemoteStorage {
        folder: String,
        description: String,
        /// Export region, whole raster when absent
        #[serde(default)]
        region: Option<Region>,
    },
}

/// Materialised export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub path: PathBuf,
    pub scale: f64,
    pub width: usize,
    pub height: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Submitted,
    Running,
    Succeeded(ExportArtifact),
    Failed(String),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded(_) | JobState::Failed(_))
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Submitted => write!(f, "submitted"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded(_) => write!(f, "succeeded"),
            JobState::Failed(_) => write!(f, "failed"),
        }
    }
}

/// Handle on an asynchronous export
///
/// Clones share the same state. Storage backends move it forward with
/// [`ExportJob::report`]; callers observe it with [`ExportJob::poll`] or
/// block on [`ExportJob::wait`].
#[derive(Debug, Clone)]
pub struct ExportJob {
    id: Uuid,
    description: String,
    state: Arc<Mutex<JobState>>,
}

impl ExportJob {
    pub fn new(description: &str) -> Self {
        ExportJob {
            id: Uuid::new_v4(),
            description: description.to_string(),
            state: Arc::new(Mutex::new(JobState::Submitted)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn poll(&self) -> JobState {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn report(&self, state: JobState) {
        let mut current = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = current.to_string();
        info!(job = %self.id, from = %previous, to = %state, "export job state");
        *current = state;
    }

    /// Poll every `interval` until the job ends; there is no timeout
    pub fn wait(&self, interval: Duration) -> Result<ExportArtifact> {
        loop {
            match self.poll() {
                JobState::Succeeded(artifact) => return Ok(artifact),
                JobState::Failed(message) => return Err(ClassificationError::Export(message)),
                JobState::Submitted | JobState::Running => thread::sleep(interval),
            }
        }
    }
}

/// Export request handed to a remote storage backend
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub raster: Raster,
    pub folder: String,
    pub description: String,
    pub scale: f64,
    pub region: Option<Region>,
}

/// Remote storage accepting asynchronous export jobs
pub trait RemoteStorage {
    /// Start the export and return at once
    fn submit(&self, request: ExportRequest) -> Result<ExportJob>;
}

/// Storage backend writing `<root>/<folder>/<description>.tif` on a worker thread
///
/// A JSON sidecar next to the GeoTIFF records the job id, scale and region.
#[derive(Debug, Clone)]
pub struct FolderStorage {
    root: PathBuf,
}

impl FolderStorage {
    pub fn new(root: &Path) -> Self {
        FolderStorage {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl RemoteStorage for FolderStorage {
    fn submit(&self, request: ExportRequest) -> Result<ExportJob> {
        let job = ExportJob::new(&request.description);
        let worker = job.clone();
        let dir = self.root.join(&request.folder);
        thread::Builder::new()
            .name(format!("export-{}", job.id()))
            .spawn(move || {
                worker.report(JobState::Running);
                match write_job(&dir, &worker, &request) {
                    Ok(artifact) => worker.report(JobState::Succeeded(artifact)),
                    Err(e) => {
                        warn!(job = %worker.id(), error = %e, "export job failed");
                        worker.report(JobState::Failed(e.to_string()));
                    }
                }
            })
            .map_err(|e| ClassificationError::io(&self.root, e))?;
        info!(job = %job.id(), description = %job.description(), "export job submitted");
        Ok(job)
    }
}

fn write_job(dir: &Path, job: &ExportJob, request: &ExportRequest) -> Result<ExportArtifact> {
    let path = dir.join(format!("{}.tif", request.description));
    geotiff::write_raster(&path, &request.raster)?;
    let sidecar = json!({
        "id": job.id().to_string(),
        "description": request.description,
        "folder": request.folder,
        "scale": request.scale,
        "region": request.region.map(|r| r.to_geojson()),
    });
    let sidecar_path = path.with_extension("json");
    fs::write(&sidecar_path, serde_json::to_string_pretty(&sidecar)?)
        .map_err(|e| ClassificationError::io(&sidecar_path, e))?;
    Ok(ExportArtifact {
        path,
        scale: request.scale,
        width: request.raster.grid().width,
        height: request.raster.grid().height,
    })
}

/// Result of [`export`]: a written file, or a job still in flight
#[derive(Debug)]
pub enum ExportOutcome {
    Local(ExportArtifact),
    Remote(ExportJob),
}

/// Export a packaged raster at `scale` metres
///
/// Local exports are written before returning. Remote exports are submitted
/// to `storage` and not awaited; the returned job must be tracked by the caller.
pub fn export(
    classified: &ClassifiedRaster,
    destination: &Destination,
    scale: f64,
    storage: Option<&dyn RemoteStorage>,
) -> Result<ExportOutcome> {
    let resampled = classified.raster().resample_nearest(scale)?;
    match destination {
        Destination::LocalFile { path } => {
            geotiff::write_raster(path, &resampled)?;
            let artifact = ExportArtifact {
                path: path.clone(),
                scale,
                width: resampled.grid().width,
                height: resampled.grid().height,
            };
            info!(
                path = %artifact.path.display(),
                scale,
                width = artifact.width,
                height = artifact.height,
                "classified raster exported"
            );
            Ok(ExportOutcome::Local(artifact))
        }
        Destination::RemoteStorage {
            folder,
            description,
            region,
        } => {
            let storage = storage.ok_or_else(|| {
                ClassificationError::Export("no remote storage configured".to_string())
            })?;
            let raster = match region {
                Some(region) => {
                    let epsg = resampled.grid().epsg;
                    if !is_geographic(epsg) {
                        return Err(ClassificationError::CrsMismatch {
                            expected: EPSG_WGS84,
                            found: epsg,
                        });
                    }
                    resampled.crop(&region.bounding_box())?
                }
                None => resampled,
            };
            let job = storage.submit(ExportRequest {
                raster,
                folder: folder.clone(),
                description: description.clone(),
                scale,
                region: *region,
            })?;
            Ok(ExportOutcome::Remote(job))
        }
    }
}

/// Re-read an exported GeoTIFF with the taxonomy attached at packaging time
pub fn read_exported(path: &Path) -> Result<(ClassifiedRaster, Taxonomy)> {
    let raster = geotiff::read_raster(path)?;
    let taxonomy = Taxonomy::from_properties(raster.properties(), CLASSIFICATION_PREFIX)?;
    Ok((ClassifiedRaster::from_raster(raster)?, taxonomy))
}
