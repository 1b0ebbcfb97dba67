use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use thiserror::Error;

pub const DPKG_FRONTEND_LOCK: &str = "/var/lib/dpkg/lock-frontend";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to lock {path}: {source}")]
    Fcntl { path: PathBuf, source: Errno },
}

/// Exclusive possession of the package-manager lock.
///
/// The lock is an open file description lock, so it conflicts with the POSIX
/// record locks apt and dpkg take on the same file, and with a second token
/// taken from this very process. Dropping the token closes the file, which
/// releases the lock.
#[derive(Debug)]
pub struct LockToken {
    file: File,
    path: PathBuf,
}

impl LockToken {
    /// Returns `Ok(None)` when somebody else holds the lock.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>, LockError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o640)
            .open(&path)
            .map_err(|source| LockError::Open {
                path: path.clone(),
                source,
            })?;

        // SAFETY: `flock` is a plain C struct, all-zero is a valid value.
        let mut request: libc::flock = unsafe { std::mem::zeroed() };
        request.l_type = libc::F_WRLCK as libc::c_short;
        request.l_whence = libc::SEEK_SET as libc::c_short;

        match fcntl(file.as_raw_fd(), FcntlArg::F_OFD_SETLK(&request)) {
            Ok(_) => Ok(Some(Self { file, path })),
            Err(Errno::EAGAIN | Errno::EACCES) => Ok(None),
            Err(source) => Err(LockError::Fcntl { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        tracing::debug!(
            target: "TransitionSystem::Lock",
            "Releasing {} (fd {})",
            self.path.display(),
            self.file.as_raw_fd()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_contended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock-frontend");

        let first = LockToken::try_acquire(&path).unwrap();
        assert!(first.is_some());
        assert!(LockToken::try_acquire(&path).unwrap().is_none());
    }

    #[test]
    fn drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock-frontend");

        drop(LockToken::try_acquire(&path).unwrap());
        let again = LockToken::try_acquire(&path).unwrap();
        assert_eq!(again.unwrap().path(), path.as_path());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("lock");
        assert!(matches!(
            LockToken::try_acquire(&path),
            Err(LockError::Open { .. })
        ));
    }
}
