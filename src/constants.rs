pub const NO_ENTRY_POINT_ERR: &str = "No Main method found in the code.";

pub const COMPILATION_EXCEPTION_PREFIX: &str = "Compilation exception";
pub const EXECUTION_EXCEPTION_PREFIX: &str = "Execution exception";

/// Written by the runtime support unit in front of the uncaught exception's
/// message. Must match `kFaultMarker` in `native/support.cpp`.
pub const FAULT_MARKER: &str = "__online_compiler_fault__: ";
