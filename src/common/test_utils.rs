use crate::address::AddressKey;
use crate::common::Provision;
use crate::provision::{ProvisionError, ProvisionStep, SystemProvisioner};
use std::collections::HashMap;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::OwnedFd;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Provisioner for tests: real sockets, scripted failures, call counters
///
/// Keys registered with [`ScriptedProvisioner::fail_open`] or
/// [`ScriptedProvisioner::fail_bind`] fail at that step with the given errno;
/// every other key is provisioned by [`SystemProvisioner`].
#[derive(Debug, Default)]
pub struct ScriptedProvisioner {
    inner: SystemProvisioner,
    open_failures: Mutex<HashMap<AddressKey, i32>>,
    bind_failures: Mutex<HashMap<AddressKey, i32>>,
    opened: AtomicUsize,
    bound: AtomicUsize,
}

impl ScriptedProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes socket creation fail for `key`
    pub fn fail_open(&self, key: &AddressKey, errno: i32) {
        lock(&self.open_failures).insert(key.clone(), errno);
    }

    /// Makes binding fail for `key`
    pub fn fail_bind(&self, key: &AddressKey, errno: i32) {
        lock(&self.bind_failures).insert(key.clone(), errno);
    }

    /// Removes every scripted failure for `key`
    pub fn heal(&self, key: &AddressKey) {
        lock(&self.open_failures).remove(key);
        lock(&self.bind_failures).remove(key);
    }

    /// Number of sockets created so far
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of successful binds so far
    pub fn bound(&self) -> usize {
        self.bound.load(Ordering::SeqCst)
    }
}

impl Provision for ScriptedProvisioner {
    fn open(&self, key: &AddressKey) -> Result<OwnedFd, ProvisionError> {
        if let Some(&errno) = lock(&self.open_failures).get(key) {
            return Err(ProvisionError::new(
                ProvisionStep::Create,
                io::Error::from_raw_os_error(errno),
            ));
        }
        let fd = self.inner.open(key)?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(fd)
    }

    fn bind(&self, fd: &OwnedFd, key: &AddressKey) -> Result<(), ProvisionError> {
        if let Some(&errno) = lock(&self.bind_failures).get(key) {
            return Err(ProvisionError::new(
                ProvisionStep::Bind,
                io::Error::from_raw_os_error(errno),
            ));
        }
        self.inner.bind(fd, key)?;
        self.bound.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Writes a reservation file readable and writable by its owner only
pub fn write_reservations(path: &Path, lines: &[&str]) -> io::Result<()> {
    let mut contents = lines.join("\n");
    contents.push('\n');
    std::fs::write(path, contents)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
