//! Application layer module
//!
//! This module contains the cleaning pipeline, review text analysis, the
//! crawl task coordinator and the scheduler that drives it.

pub mod crawl_coordinator;
pub mod data_cleaner;
pub mod scheduler;
pub mod text_analysis;

pub use crawl_coordinator::{CrawlRequest, CrawlTaskCoordinator};
pub use data_cleaner::{CleanBatch, CleaningPipeline, Rejection};
pub use scheduler::{CrawlScheduler, TriggerOutcome};
