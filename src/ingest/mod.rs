pub mod handler;

use crate::config::IngestConfig;
use deadpool_sqlite::Pool;

/// Shared state for the score write path and health check.
pub struct IngestState {
    pub pool: Pool,
    pub config: IngestConfig,
}
