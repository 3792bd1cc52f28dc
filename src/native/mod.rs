//! Native module contains implementations of core traits that drive the
//! host toolchain and run programs as plain child processes, relying on
//! rlimits and pipes instead of containers.
pub mod compiler;
pub mod diagnostics;
pub mod elf;
pub mod executor;
pub mod file_store;
pub mod references;
mod scratch;
pub mod support;
