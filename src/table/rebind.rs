//! In-place replacement of an entry's socket
//!
//! The replacement is created and configured before anything happens to the
//! current handle. It is then bound while the current handle is still held.
//! Only when that bind reports `EADDRINUSE` is the current handle released
//! and the bind retried; if the retry fails too, the entry is left absent.
//! Any other failure leaves the current handle in place. An absent local
//! pathname entry also retries after clearing a leftover socket file, since
//! nothing in the table holds that path any more.
//!
//! Rebinds of one entry are serialized. A caller that queued behind another
//! rebind of the same entry gets that rebind's result instead of binding a
//! third socket.

use super::generation::Entry;
use crate::address::AddressKey;
use crate::common::Provision;
use crate::provision::{ReservedSocket, SocketHandle, remove_stale_socket};
use std::sync::{Arc, PoisonError};
use tracing::{info, warn};

pub(crate) fn rebind(
    entry: &Entry,
    key: &AddressKey,
    provisioner: &dyn Provision,
) -> Option<SocketHandle> {
    let observed = entry.handle.load_full();
    let _serialized = entry
        .rebind_lock
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    let current = entry.handle.load_full();
    if !same_handle(&observed, &current) {
        return current;
    }
    // the old socket must be able to close once released below
    drop(observed);

    let fd = match provisioner.open(key) {
        Ok(fd) => fd,
        Err(e) => {
            warn!(address = %key, step = %e.step, os_error = e.raw_os_error(), error = %e, "Rebind failed, keeping current handle");
            return current;
        }
    };

    match provisioner.bind(&fd, key) {
        Ok(()) => {}
        Err(e)
            if e.raw_os_error() == Some(libc::EADDRINUSE)
                && (current.is_some() || key.path().is_some()) =>
        {
            if current.is_some() {
                entry.handle.store(None);
                drop(current);
            }
            if let Some(path) = key.path() {
                if let Err(e) = remove_stale_socket(path) {
                    warn!(address = %key, os_error = e.raw_os_error(), error = %e, "Could not remove stale socket file");
                }
            }
            if let Err(e) = provisioner.bind(&fd, key) {
                warn!(
                    address = %key,
                    step = %e.step,
                    os_error = e.raw_os_error(),
                    error = %e,
                    "Rebind failed after releasing the previous handle, reservation is absent"
                );
                return None;
            }
        }
        Err(e) => {
            warn!(address = %key, step = %e.step, os_error = e.raw_os_error(), error = %e, "Rebind failed, keeping current handle");
            return current;
        }
    }

    let fresh = Arc::new(ReservedSocket::bound(fd, key));
    entry.handle.store(Some(Arc::clone(&fresh)));
    info!(address = %key, "Rebound reserved address");
    Some(fresh)
}

fn same_handle(a: &Option<SocketHandle>, b: &Option<SocketHandle>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
