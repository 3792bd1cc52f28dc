pub mod compiler;
pub mod executor;
pub mod file_store;
