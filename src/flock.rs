//! Single-instance guard (spec.md §5 "Single-instance guard"). A
//! named system-wide mutex on Windows; here, a non-blocking exclusive
//! `flock` on a well-known file, same mechanism as the pack's own CLI
//! tooling uses for its instance lock.

use anyhow::anyhow;
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use std::fs::File;
use std::os::fd::AsRawFd;

pub struct InstanceLock {
    _file: File,
}

impl InstanceLock {
    /// Acquires the lock at `path`, creating the file if needed.
    /// Fails fast and distinguishably if another instance already
    /// holds it (spec.md §5).
    pub fn acquire(path: &std::path::Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(_) => Ok(Self { _file: file }),
            Err(Errno::EAGAIN) | Err(Errno::EWOULDBLOCK) => {
                Err(anyhow!("another instance of usbipd is already running"))
            }
            Err(e) => Err(anyhow!("failed to acquire instance lock at {}: {e}", path.display())),
        }
    }
}

pub fn default_lock_path() -> std::path::PathBuf {
    std::path::Path::new("/run/usbipd.lock").to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbipd.lock");
        let first = InstanceLock::acquire(&path).unwrap();
        let second = InstanceLock::acquire(&path);
        assert!(second.is_err());
        drop(first);
        assert!(InstanceLock::acquire(&path).is_ok());
    }
}
