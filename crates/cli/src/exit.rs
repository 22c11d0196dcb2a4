//! Process exit codes shared by the server and worker binaries.

/// Clean shutdown.
pub const OK: u8 = 0;
/// Configuration rejected at startup.
pub const CONFIG: u8 = 1;
/// The worker gave up reconnecting.
pub const RECONNECT: u8 = 2;
/// Unrecoverable protocol violation.
pub const PROTOCOL: u8 = 3;
