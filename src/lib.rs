pub mod audio;
pub mod classify;
pub mod config;
pub mod crosscheck;
pub mod error;
pub mod filter;
pub mod interactive;
pub mod pipeline;
pub mod recognize;
pub mod rename;
pub mod results;

pub use config::Config;
pub use error::{EmotagError, Result};
pub use pipeline::{
    print_summary, run_pipeline, run_pipeline_with_cancel, Backends, PipelineConfig,
    PipelineResult, PipelineStats,
};
