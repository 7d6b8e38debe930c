use thiserror::Error;

/// Failures of the trajectory conservation pipeline
#[derive(Error, Debug)]
pub enum LentilError {
    /// a collaborator or a setting is unusable; fatal at call time
    #[error("configuration error: {0}")]
    Configuration(String),

    /// malformed input; fatal for the call
    #[error("invalid data: {0}")]
    DataShape(String),

    /// one gene's model could not be fitted
    #[error("model fit failed for gene {gene}: {reason}")]
    ModelFit { gene: Box<str>, reason: String },

    /// the metric store is missing something it must have
    #[error("store error: {0}")]
    Store(String),

    #[error("store error: {0}")]
    Hdf5(#[from] hdf5::Error),

    /// plot or model artifact could not be written
    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LentilError {
    pub fn model_fit(gene: &str, reason: impl std::fmt::Display) -> Self {
        LentilError::ModelFit {
            gene: gene.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LentilError>;
