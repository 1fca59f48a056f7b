//! Process identity and memory mapping primitives

use crate::error::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Source of the calling process' identity and of peer liveness.
pub trait ProcessIdentity: Send + Sync {
    /// PID of the calling process.
    fn current_pid(&self) -> u32;

    /// Whether `pid` still designates a running process.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Identity backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcess;

impl ProcessIdentity for OsProcess {
    fn current_pid(&self) -> u32 {
        get_current_pid()
    }

    fn is_alive(&self, pid: u32) -> bool {
        is_process_alive(pid)
    }
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Use a null signal (None) to test for process existence without sending a signal
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false, // No such process
        Err(nix::Error::EPERM) => true,  // Process exists but no permission to signal
        Err(_) => false,
    }
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

/// Map a zero-filled, process-private segment.
pub fn map_anonymous(size: usize) -> ShmResult<MmapMut> {
    MmapOptions::new()
        .len(size)
        .map_anon()
        .map_err(|source| ShmError::MapFailed { source })
}

/// Create (or truncate) a segment file and grow it to `size` bytes.
pub fn create_segment_file(path: &Path, size: usize) -> ShmResult<File> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .mode(0o600) // Owner read/write only
        .open(path)?;

    // Start empty so stale content from an earlier run never leaks through
    file.set_len(0)?;
    file.set_len(size as u64)?;
    Ok(file)
}

/// Map a segment file shared, so that every process sees the same bytes.
pub fn map_segment_file(path: &Path) -> ShmResult<MmapMut> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    map_file(&file)
}

/// Map an already opened segment file.
pub fn map_file(file: &File) -> ShmResult<MmapMut> {
    unsafe { MmapOptions::new().map_mut(file) }.map_err(|source| ShmError::MapFailed { source })
}
