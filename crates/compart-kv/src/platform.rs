//! Platform-specific durable sync
//!
//! Maps "make these bytes survive power loss" onto the strongest primitive
//! each platform offers.

use std::fs::File;
use std::io;
use std::path::Path;

/// Block until the file's data has reached persistent storage.
///
/// - Linux: `fdatasync()`, data only, metadata is left to the next fsync
/// - macOS/iOS: `fcntl(F_FULLFSYNC)`, plain fsync stops at the drive cache there
/// - Other: `File::sync_data()`
///
/// Must not be called while holding a lock that readers need; the call can
/// block for milliseconds under heavy I/O.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor comes from a live `File` borrow.
        let result = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor comes from a live `File` borrow.
        let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
    {
        file.sync_data()
    }
}

/// Persist directory entries (renames, new segments) on platforms that
/// support syncing a directory handle. A no-op elsewhere.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}
