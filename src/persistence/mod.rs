//! Persistence layer for resumable execution
//!
//! - [`StateStore`] backends: JSON files, PostgreSQL, in-memory
//! - [`StateRepository`] for per-wallet atomic read/modify/write

pub mod file_store;
pub mod memory_store;
pub mod postgres_store;
pub mod state_store;

pub use file_store::FileStateStore;
pub use memory_store::MemoryStateStore;
pub use postgres_store::PostgresStateStore;
pub use state_store::{StateRepository, StateStore};

use std::sync::Arc;

use crate::config::{StateBackend, StateConfig};
use crate::error::{LpFlowError, Result};

/// Open the backend selected in config
pub async fn open_store(config: &StateConfig) -> Result<Arc<dyn StateStore>> {
    match config.backend {
        StateBackend::File => Ok(Arc::new(FileStateStore::open(config.resolved_dir()).await?)),
        StateBackend::Postgres => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                LpFlowError::ConfigMissing("state.database_url is required for postgres".into())
            })?;
            let store = PostgresStateStore::new(url, config.max_connections).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}
