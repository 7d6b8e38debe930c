pub mod batch_fit;
pub mod common;
pub mod conservation;
pub mod error;
pub mod ess_engine;
pub mod gam_model;
pub mod gam_spline;
pub mod gene_model;
pub mod gene_plot;
pub mod input;
pub mod metric_extract;
pub mod metric_store;
pub mod simulate;
pub mod tensor_builder;

pub use error::{LentilError, Result};
