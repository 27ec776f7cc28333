use super::validation;
use crate::address::AddressKey;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared handle to a reserved socket
///
/// A handle stays open for as long as any table entry or reader holds it.
pub type SocketHandle = Arc<ReservedSocket>;

/// A bound socket held on behalf of clients
#[derive(Debug)]
pub struct ReservedSocket {
    fd: OwnedFd,
    file: Option<SocketFile>,
}

/// Filesystem entry created by binding a local pathname socket
#[derive(Debug)]
struct SocketFile {
    path: PathBuf,
    dev: u64,
    ino: u64,
}

impl SocketFile {
    fn stat(path: &Path) -> Option<Self> {
        let meta = std::fs::symlink_metadata(path).ok()?;
        meta.file_type().is_socket().then(|| Self {
            path: path.to_path_buf(),
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    /// Removes the file unless something else has been bound at the path since
    fn remove(&self) -> io::Result<bool> {
        match SocketFile::stat(&self.path) {
            Some(now) if now.dev == self.dev && now.ino == self.ino => {
                std::fs::remove_file(&self.path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl ReservedSocket {
    /// Takes ownership of an already bound descriptor
    ///
    /// The socket file of a pathname address is left alone on drop; use
    /// [`ReservedSocket::bound`] to have it removed with the socket.
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd, file: None }
    }

    /// Takes ownership of a descriptor just bound to `key`
    ///
    /// For a local pathname key the socket file created by the bind is
    /// removed again when the socket is dropped, so the address can be
    /// bound afresh later.
    pub fn bound(fd: OwnedFd, key: &AddressKey) -> Self {
        Self {
            fd,
            file: key.path().and_then(SocketFile::stat),
        }
    }

    /// Kernel-side socket type (`SOCK_STREAM`, `SOCK_DGRAM`, ...)
    pub fn socket_type(&self) -> io::Result<libc::c_int> {
        validation::socket_type(self.fd.as_fd())
    }

    /// Address family the socket is bound with
    pub fn family(&self) -> io::Result<libc::c_int> {
        validation::bound_family(self.fd.as_fd())
    }

    /// Duplicates the descriptor for hand-off to a client
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }
}

impl AsFd for ReservedSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for ReservedSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for ReservedSocket {
    fn drop(&mut self) {
        debug!(fd = self.fd.as_raw_fd(), "Closing reserved socket");
        if let Some(file) = &self.file {
            match file.remove() {
                Ok(true) => debug!(path = %file.path.display(), "Removed socket file"),
                Ok(false) => {}
                Err(e) => warn!(
                    path = %file.path.display(),
                    os_error = e.raw_os_error(),
                    error = %e,
                    "Could not remove socket file"
                ),
            }
        }
    }
}
