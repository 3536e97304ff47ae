// Data model definitions for the code-index database

pub mod definition;
pub mod file_record;
pub mod file_tag;
pub mod import;
pub mod symbol;

pub use definition::Definition;
pub use file_record::FileRecord;
pub use file_tag::FileTag;
pub use import::Import;
pub use symbol::SymbolOccurrence;
