
pub use crate::error::{LentilError, Result};
pub use log::{debug, info, warn};

pub type Mat = nalgebra::DMatrix<f32>;
pub type DVec = nalgebra::DVector<f32>;
pub type CscMat = nalgebra_sparse::CscMatrix<f32>;

/// column names of the per-batch weight table, in the order they
/// are persisted under `metadata/metric_names`
pub const METRIC_NAMES: [&str; 7] = [
    "Estimate",
    "Est.Error",
    "Q2.5",
    "Q97.5",
    "shape",
    "weight",
    "weight_norm",
];

/// the batch label column of the weight table
pub const ARRAY_COLUMN: &str = "array";

pub const ARRAY_WEIGHTS_GROUP: &str = "array_weights";
pub const METADATA_GROUP: &str = "metadata";
pub const METRIC_NAMES_PATH: &str = "metadata/metric_names";

/// Write the settings of a run as pretty JSON
pub fn write_parameters(param_file: &str, params: &serde_json::Value) -> Result<()> {
    std::fs::write(param_file, serde_json::to_string_pretty(params)?)?;
    info!("Wrote parameters: {}", param_file);
    Ok(())
}
