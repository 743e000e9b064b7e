pub mod binning;
pub mod buckets;
pub mod engine;
pub mod handler;
pub mod matching;
pub mod sampling;
pub mod series;
pub mod stats;
pub mod types;

pub use engine::ComparisonEngine;
