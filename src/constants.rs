//! Global constants for pario
//!
//! Message tags, wire limits and the defaults that the configuration layer
//! falls back to.

/// Tag of operation requests sent from the computational master to the I/O
/// master over the union communicator
pub const MSG_TAG: i32 = 1;

/// Tag of encoded buffer nodes sent to the I/O master during a flush
pub const NODE_TAG: i32 = 2;

/// Maximum path length carried in an operation request (4KB)
pub const MAX_PATH_LENGTH: usize = 4096;

/// Default size of the backend-side aggregation buffer (10MB)
pub const DEFAULT_BUFFER_SIZE_LIMIT: usize = 10 * 1024 * 1024;

/// Default number of variables one buffer node holds
pub const DEFAULT_MAX_VARS_PER_BUFFER: usize = 64;

/// Upper bound accepted for `max_vars_per_buffer`
pub const MAX_VARS_PER_BUFFER_LIMIT: usize = 65536;

/// Spare buffer nodes created when the pool is built
pub const DEFAULT_POOL_PREALLOCATE: usize = 4;

/// First id handed out by `init_*`
pub const FIRST_IOSYSID: i32 = 1;

/// Lowest file id handed out by `open`/`create`
pub const FIRST_FILE_ID: i32 = 1;
