//! Evaluation of frequency counter data from optical frequency comb
//! measurements: loading, automatic and manual rejection of samples, Allan
//! deviations and exact optical frequencies and ratios.

pub mod color;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod report;
pub mod state;
pub mod stats;

pub use config::AnalysisConfig;
pub use report::Report;
pub use state::Session;
