pub mod comparison;
pub mod config;
pub mod error;
pub mod ingest;
pub mod routes;
pub mod storage;
pub mod store;
pub mod types;
