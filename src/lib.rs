//! SpiderMail - E-commerce Product & Review Crawler
//!
//! Crawls e-commerce platforms for product listings and reviews, cleans and
//! deduplicates the extracted records and persists them with price history,
//! on a daily schedule or on demand.

// Module declarations
pub mod domain;
pub mod application;
pub mod infrastructure;

// Re-export the pieces the entry point wires together
pub use application::{CrawlRequest, CrawlScheduler, CrawlTaskCoordinator, TriggerOutcome};
pub use domain::{CrawlTask, Platform, TaskStatus};
