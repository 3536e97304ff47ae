// Query composition and optimization layer

pub mod builder;
pub mod heuristics;
pub mod optimizer;

pub use builder::{QueryBuilder, SortOrder};
pub use optimizer::QueryOptimizer;
