use std::path::PathBuf;
use thiserror::Error;

/// Result alias used by every pipeline stage
pub type Result<T> = std::result::Result<T, ClassificationError>;

/// Errors raised by the classification pipeline
///
/// Everything except `ThumbnailConversion` aborts a pipeline run. Thumbnail
/// failures are per-file: they are logged and collected in the batch report.
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("no scenes in collection '{collection}' match the region and date filters")]
    NoScenesFound { collection: String },

    #[error("taxonomy metadata missing or malformed: {key}")]
    TaxonomyMissing { key: String },

    #[error("reference pixel value {code} is not a known taxonomy code")]
    UnknownClassCode { code: i32 },

    #[error("unknown layer: {0}")]
    UnknownLayer(String),

    #[error("training set is empty, a tree cannot be grown")]
    EmptyTrainingSet,

    #[error("band mismatch: {0}")]
    BandMismatch(String),

    #[error("training set is labelled by '{expected}', not '{found}'")]
    UnknownLabelField { expected: String, found: String },

    #[error("invalid band pattern '{pattern}': {source}")]
    InvalidBandPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("CRS mismatch: expected EPSG:{expected}, found EPSG:{found}")]
    CrsMismatch { expected: i32, found: i32 },

    #[error("thumbnail conversion failed for {path:?}: {message}")]
    ThumbnailConversion { path: PathBuf, message: String },

    #[error("export failed: {0}")]
    Export(String),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl ClassificationError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ClassificationError::Io {
            path: path.into(),
            source,
        }
    }

    /// Fatal errors abort the pipeline run; there is no retry anywhere
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ClassificationError::ThumbnailConversion { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumbnail_errors_are_not_fatal() {
        let err = ClassificationError::ThumbnailConversion {
            path: PathBuf::from("a.tif"),
            message: "bad header".to_string(),
        };
        assert!(!err.is_fatal());
        assert!(ClassificationError::EmptyTrainingSet.is_fatal());
        assert!(ClassificationError::NoScenesFound {
            collection: "c".to_string()
        }
        .is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = ClassificationError::TaxonomyMissing {
            key: "landcover_class_names".to_string(),
        };
        assert!(err.to_string().contains("landcover_class_names"));
    }
}
