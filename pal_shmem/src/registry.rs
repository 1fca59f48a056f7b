//! Process registry for file-backed segments.
//!
//! A lock file next to the segment files holds the JSON list of PIDs using
//! the segments. It is only read or rewritten under an exclusive `flock`,
//! which serializes attach and detach across processes. The first process
//! to find no live peer creates segment 0; the last one to leave removes
//! every segment file.

use crate::error::ShmResult;
use crate::platform::ProcessIdentity;
use crate::segment::{decode_suffix, segment_file_path, segment_suffix};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::stat::{fstat, stat};
use pal::consts::{MAX_SEGMENTS, SEGMENT_NAME_LEN};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProcessList {
    pids: Vec<u32>,
}

/// Location of the registry and segment files.
#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
    prefix: String,
}

/// Exclusive hold on the registry lock file.
pub struct RegistryLock {
    file: Flock<File>,
    path: PathBuf,
}

impl Registry {
    /// Registry for segments named `{dir}/{prefix}_segment_N`.
    pub fn new(dir: &Path, prefix: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
        }
    }

    /// Path of the lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.lock", self.prefix))
    }

    /// Block until the registry is exclusively ours.
    ///
    /// The last process to detach unlinks the lock file while holding it.
    /// A lock won on such an unlinked file is dropped and taken again on
    /// the file now at the path.
    pub fn lock(&self) -> ShmResult<RegistryLock> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.lock_path();
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .mode(0o600)
                .open(&path)?;
            let file = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| errno)?;
            if is_current(&file, &path)? {
                return Ok(RegistryLock { file, path });
            }
            debug!(path = %path.display(), "registry lock file replaced while waiting; retrying");
        }
    }

    /// Remove every segment file reachable from segment 1.
    ///
    /// Follows the chain stored in each segment header. Returns the number
    /// of files removed.
    pub fn unlink_segments(&self) -> usize {
        let mut suffix = segment_suffix(0);
        let mut removed = 0;
        for _ in 0..MAX_SEGMENTS {
            let path = segment_file_path(&self.dir, &self.prefix, &suffix);
            let next = match read_next_segment(&path) {
                Ok(next) => next,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "segment chain ends");
                    break;
                }
            };
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove segment file");
                break;
            }
            removed += 1;
            match next {
                Some(next) => suffix = next,
                None => break,
            }
        }
        removed
    }
}

/// Whether the locked file is still the one linked at `path`.
fn is_current(file: &File, path: &Path) -> ShmResult<bool> {
    let held = fstat(file)?;
    match stat(path) {
        Ok(linked) => Ok(linked.st_dev == held.st_dev && linked.st_ino == held.st_ino),
        Err(Errno::ENOENT) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn read_next_segment(path: &Path) -> std::io::Result<Option<String>> {
    let mut raw = [0u8; SEGMENT_NAME_LEN];
    File::open(path)?.read_exact(&mut raw)?;
    Ok(decode_suffix(&raw))
}

impl RegistryLock {
    /// Registered PIDs. An empty or unreadable file counts as no process.
    pub fn read_pids(&mut self) -> ShmResult<Vec<u32>> {
        let mut content = String::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_string(&mut content)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<ProcessList>(&content) {
            Ok(list) => Ok(list.pids),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "discarding unreadable process list"
                );
                Ok(Vec::new())
            }
        }
    }

    /// Replace the registered PIDs.
    pub fn write_pids(&mut self, pids: &[u32]) -> ShmResult<()> {
        let json = serde_json::to_string(&ProcessList {
            pids: pids.to_vec(),
        })?;
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(json.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }

    /// Registered PIDs that are still alive.
    ///
    /// Dead entries belong to processes that never detached. A process
    /// appears once per attached context.
    pub fn live_pids(&mut self, identity: &dyn ProcessIdentity) -> ShmResult<Vec<u32>> {
        let mut pids = self.read_pids()?;
        pids.retain(|&pid| {
            let alive = identity.is_alive(pid);
            if !alive {
                info!(pid, "removing dead process from registry");
            }
            alive
        });
        Ok(pids)
    }

    /// Empty the process list and delete the lock file. The lock itself is
    /// released on drop.
    pub fn remove_file(&mut self) {
        if let Err(e) = self.write_pids(&[]) {
            warn!(path = %self.path.display(), error = %e, "failed to clear registry");
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove registry lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::OsProcess;

    #[test]
    fn test_pid_list_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path(), "reg");

        let mut lock = registry.lock().unwrap();
        assert!(lock.read_pids().unwrap().is_empty());
        lock.write_pids(&[1, 22, 333]).unwrap();
        lock.write_pids(&[7]).unwrap();
        assert_eq!(lock.read_pids().unwrap(), vec![7]);
        drop(lock);

        let mut lock = registry.lock().unwrap();
        assert_eq!(lock.read_pids().unwrap(), vec![7]);
        assert!(registry.lock_path().ends_with("reg.lock"));
    }

    #[test]
    fn test_live_pids_drops_dead_processes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path(), "reg");
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead = child.id();
        child.wait().unwrap();
        let me = std::process::id();

        let mut lock = registry.lock().unwrap();
        lock.write_pids(&[dead, me, me]).unwrap();
        assert_eq!(lock.live_pids(&OsProcess).unwrap(), vec![me, me]);
    }

    #[test]
    fn test_waiter_relocks_after_lock_file_removed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path(), "reg");

        let mut holder = registry.lock().unwrap();
        holder.write_pids(&[41]).unwrap();

        let waiter = std::thread::spawn({
            let registry = registry.clone();
            move || {
                let mut lock = registry.lock().unwrap();
                let pids = lock.read_pids().unwrap();
                lock.write_pids(&[42]).unwrap();
                pids
            }
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        holder.remove_file();
        drop(holder);

        assert!(waiter.join().unwrap().is_empty());
        let mut lock = registry.lock().unwrap();
        assert_eq!(lock.read_pids().unwrap(), vec![42]);
    }

    #[test]
    fn test_remove_file_clears_pids() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path(), "reg");
        let mut lock = registry.lock().unwrap();
        lock.write_pids(&[5]).unwrap();
        lock.remove_file();

        assert!(lock.read_pids().unwrap().is_empty());
        assert!(!registry.lock_path().exists());
    }

    #[test]
    fn test_garbage_registry_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path(), "reg");
        std::fs::write(registry.lock_path(), b"not json").unwrap();

        let mut lock = registry.lock().unwrap();
        assert!(lock.read_pids().unwrap().is_empty());
    }

    #[test]
    fn test_unlink_follows_chain() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path(), "chain");

        let mut first = [0u8; 64];
        first[..9].copy_from_slice(b"segment_2");
        std::fs::write(dir.path().join("chain_segment_1"), first).unwrap();
        std::fs::write(dir.path().join("chain_segment_2"), [0u8; 64]).unwrap();
        std::fs::write(dir.path().join("chain_segment_3"), [0u8; 64]).unwrap();

        assert_eq!(registry.unlink_segments(), 2);
        assert!(!dir.path().join("chain_segment_1").exists());
        assert!(!dir.path().join("chain_segment_2").exists());
        // Not linked from segment 2.
        assert!(dir.path().join("chain_segment_3").exists());
    }
}
