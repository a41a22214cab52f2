//! `sysexits(3)` statuses reported by the daemon binary.

/// Successful termination.
pub const EX_OK: u8 = 0;
/// Launch failed for a reason with no more specific status.
pub const EX_FAILURE: u8 = 1;
/// The binary was built for a platform without process supervision.
pub const EX_SOFTWARE: u8 = 70;
/// Flushing or closing the store failed during shutdown.
pub const EX_IOERR: u8 = 74;
/// Another instance holds the lock; retry later.
pub const EX_TEMPFAIL: u8 = 75;
/// Configuration or filter file error.
pub const EX_CONFIG: u8 = 78;
