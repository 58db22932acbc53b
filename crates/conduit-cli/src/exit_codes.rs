//! Process exit codes of the `conduit` binary.

pub const SUCCESS: i32 = 0;
pub const BUILD_FAILED: i32 = 1; // Build finished with a non-success status
pub const INTERNAL_ERROR: i32 = 2; // Config, setup or persistence failure
