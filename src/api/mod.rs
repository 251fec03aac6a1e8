pub mod error;
pub mod handlers;
pub mod router;
pub mod types;

pub use error::ApiError;
pub use router::api_router;
pub use types::AppContext;

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::sync::Arc;

    use crate::config::AppConfig;
    use crate::db::sqlite::open_memory_database;
    use crate::llm::ChatClient;
    use crate::storage::FileStore;

    use super::AppContext;

    /// In-memory context for router and handler tests.
    pub fn test_context(
        chat: impl ChatClient + 'static,
        config: AppConfig,
        dir: &Path,
    ) -> AppContext {
        let conn = open_memory_database().unwrap();
        let files = FileStore::new(dir.join("uploads")).unwrap();
        AppContext::new(config, conn, files, Arc::new(chat))
    }
}
