// Storage subsystem: pooled SQLite access, schema migrations, and the
// file/symbol/search repositories.

pub mod file_repository;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod search_cache;
pub mod search_repository;
pub mod service;
pub mod symbol_repository;
pub mod tag_expansion;

pub use file_repository::{FileRepository, FileUpdate, ListOptions, SortKey};
pub use migrations::{builtin_migrations, Migration, MigrationManager};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use search_repository::{SearchHit, SearchOptions, SearchRepository};
pub use service::{DatabaseService, HealthStatus, RunResult};
pub use symbol_repository::SymbolRepository;
