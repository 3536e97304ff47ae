//! Code-Index Storage Engine
//!
//! An embedded, file-backed relational store that indexes source files and
//! their extracted symbols and serves structured and full-text search over
//! them. The engine owns the connection pool, schema migrations, the
//! file/symbol/search repositories, query optimization, and the closed
//! metrics-to-degradation control loop; file discovery, parsing, and the
//! outward request protocol belong to the embedding host.

pub mod config;
pub mod error;
pub mod monitor;
pub mod query;
pub mod resilience;
pub mod storage;
pub mod store;

// Re-export the public surface
pub use config::{StoreConfig, MAX_CACHE_SIZE};
pub use error::{ErrorKind, Result, StoreError};
pub use monitor::{Capability, DegradationLevel, DegradationManager, ErrorAggregator, PerformanceMonitor};
pub use query::{QueryBuilder, QueryOptimizer, SortOrder};
pub use storage::models::file_record::content_hash;
pub use storage::models::{Definition, FileRecord, FileTag, Import, SymbolOccurrence};
pub use storage::{
    ConnectionPool, DatabaseService, FileRepository, FileUpdate, ListOptions, MigrationManager,
    SearchHit, SearchOptions, SearchRepository, SortKey, SymbolRepository,
};
pub use store::Store;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
