//! Network namespace handles and scoped entry.
//!
//! Entering a namespace is modelled as a capability: [`NetNs::enter`] hands
//! out a guard that switched the calling thread into the target namespace
//! and switches it back when dropped, on every exit path. The caller must
//! stay on one OS thread between acquisition and drop; the crate runs on a
//! current-thread runtime for exactly that reason.

use nix::sched::{CloneFlags, setns};
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum NetnsError {
    /// The namespace path no longer exists. At release time this means the
    /// interfaces inside it are already gone and teardown can stop.
    #[error("network namespace {path} does not exist")]
    Gone { path: PathBuf },

    #[error("failed to open network namespace {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to open the current network namespace: {source}")]
    Current { source: io::Error },

    #[error("failed to enter network namespace {path}: {source}")]
    Enter {
        path: PathBuf,
        source: nix::errno::Errno,
    },
}

pub type Result<T> = std::result::Result<T, NetnsError>;

const CURRENT_NETNS: &str = "/proc/self/ns/net";

/// An open handle to a network namespace.
///
/// Borrowed for the duration of one setup or release call; never retained.
#[derive(Debug)]
pub struct NetNs {
    path: PathBuf,
    file: File,
}

impl NetNs {
    /// Open a namespace by path (e.g. `/var/run/netns/<id>` or
    /// `/proc/<pid>/ns/net`). A missing path is reported as
    /// [`NetnsError::Gone`] so release paths can treat it as success.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                NetnsError::Gone { path: path.clone() }
            } else {
                NetnsError::Open {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        Ok(Self { path, file })
    }

    /// Handle to the namespace the calling thread currently runs in.
    pub fn current() -> Result<Self> {
        let file =
            File::open(CURRENT_NETNS).map_err(|source| NetnsError::Current { source })?;
        Ok(Self {
            path: PathBuf::from(CURRENT_NETNS),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    /// Switch the calling thread into this namespace until the returned
    /// guard is dropped.
    pub fn enter(&self) -> Result<NetnsGuard> {
        let original =
            File::open(CURRENT_NETNS).map_err(|source| NetnsError::Current { source })?;
        setns(self.file.as_fd(), CloneFlags::CLONE_NEWNET).map_err(|source| {
            NetnsError::Enter {
                path: self.path.clone(),
                source,
            }
        })?;
        trace!(netns = %self.path.display(), "entered network namespace");
        Ok(NetnsGuard { original })
    }
}

/// Restores the original namespace on drop.
pub struct NetnsGuard {
    original: File,
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        // A thread stranded in the wrong namespace would silently corrupt
        // every later operation; this must not be survivable.
        if let Err(e) = setns(self.original.as_fd(), CloneFlags::CLONE_NEWNET) {
            panic!("failed to restore the original network namespace: {e}");
        }
        trace!("restored original network namespace");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_namespace_is_gone() {
        let err = NetNs::open("/var/run/netns/does-not-exist-a1b2c3").unwrap_err();
        assert!(matches!(err, NetnsError::Gone { .. }));
    }

    #[test]
    fn current_namespace_opens() {
        let ns = NetNs::current().unwrap();
        assert_eq!(ns.path(), Path::new("/proc/self/ns/net"));
    }

    #[test]
    fn entering_own_namespace_round_trips() {
        let ns = NetNs::current().unwrap();
        match ns.enter() {
            Ok(guard) => drop(guard),
            // unprivileged runners cannot setns at all
            Err(NetnsError::Enter {
                source: nix::errno::Errno::EPERM,
                ..
            }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
