use crate::address::AddressKey;
use crate::provision::{ProvisionError, ReservedSocket};
use std::os::unix::io::OwnedFd;

/// Creates and binds the sockets behind reservations
///
/// Provisioning is split in two steps so that a rebind can create and
/// configure its replacement before touching the handle it replaces.
pub trait Provision: Send + Sync {
    /// Creates and configures an unbound socket for `key`
    fn open(&self, key: &AddressKey) -> Result<OwnedFd, ProvisionError>;

    /// Binds a socket returned by [`Provision::open`] to the key's address
    fn bind(&self, fd: &OwnedFd, key: &AddressKey) -> Result<(), ProvisionError>;

    /// Creates, configures and binds a socket in one go
    ///
    /// A descriptor created before a failing step is closed on return. The
    /// returned socket removes its pathname socket file when dropped.
    fn provision(&self, key: &AddressKey) -> Result<ReservedSocket, ProvisionError> {
        let fd = self.open(key)?;
        self.bind(&fd, key)?;
        Ok(ReservedSocket::bound(fd, key))
    }
}
