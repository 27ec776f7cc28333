use super::{ProvisionError, ProvisionStep, validation};
use crate::address::AddressKey;
use crate::common::Provision;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use tracing::debug;

/// Provisioner backed by the operating system's socket calls
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvisioner;

impl SystemProvisioner {
    pub fn new() -> Self {
        Self
    }
}

impl Provision for SystemProvisioner {
    fn open(&self, key: &AddressKey) -> Result<OwnedFd, ProvisionError> {
        // Safety: plain syscall, the result is checked before use
        let raw = unsafe {
            libc::socket(
                key.family().as_raw(),
                key.socket_type().as_raw() | libc::SOCK_CLOEXEC,
                key.protocol(),
            )
        };
        if raw == -1 {
            return Err(ProvisionError::last_os_error(ProvisionStep::Create));
        }
        // Safety: raw is a freshly created descriptor nobody else owns
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if key.family().is_inet() {
            set_reuse_addr(&fd)?;
        }
        Ok(fd)
    }

    fn bind(&self, fd: &OwnedFd, key: &AddressKey) -> Result<(), ProvisionError> {
        let bytes = key.as_bytes();
        if bytes.len() > std::mem::size_of::<libc::sockaddr_storage>() {
            return Err(ProvisionError::new(
                ProvisionStep::Bind,
                io::Error::from_raw_os_error(libc::EINVAL),
            ));
        }

        // Copy into aligned storage; the key's bytes carry no alignment guarantee
        // Safety: sockaddr_storage is plain old data and large enough for bytes
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                &mut storage as *mut _ as *mut u8,
                bytes.len(),
            );
        }

        // Safety: storage holds bytes.len() valid address bytes
        let result = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &storage as *const _ as *const libc::sockaddr,
                bytes.len() as libc::socklen_t,
            )
        };
        if result != 0 {
            return Err(ProvisionError::last_os_error(ProvisionStep::Bind));
        }

        debug!(
            address = %key,
            fd = fd.as_raw_fd(),
            family = validation::family_name(key.family().as_raw()),
            "Bound reserved socket"
        );
        Ok(())
    }
}

fn set_reuse_addr(fd: &OwnedFd) -> Result<(), ProvisionError> {
    let flag: libc::c_int = 1;
    // Safety: flag outlives the call and the length matches its type
    let result = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &flag as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result != 0 {
        return Err(ProvisionError::last_os_error(ProvisionStep::SetOption));
    }
    Ok(())
}

/// Removes a leftover socket file at `path`
///
/// Only socket files are removed; anything else at the path is left alone.
/// Returns true if a file was removed.
pub fn remove_stale_socket(path: &Path) -> io::Result<bool> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            std::fs::remove_file(path)?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
