pub mod chain;
pub mod diagnostics;
pub mod ess;
pub mod traits;
