//! Socket provisioning
//!
//! Creates, configures and binds the OS socket behind one reservation. Every
//! intermediate descriptor is an `OwnedFd`, so a failure at any step closes
//! whatever was created so far.

pub mod socket;
pub mod system;
pub mod validation;

pub use socket::{ReservedSocket, SocketHandle};
pub use system::{SystemProvisioner, remove_stale_socket};

use std::fmt;
use std::io;
use thiserror::Error;

/// Step of socket provisioning that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    Create,
    SetOption,
    Bind,
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProvisionStep::Create => "socket",
            ProvisionStep::SetOption => "setsockopt",
            ProvisionStep::Bind => "bind",
        })
    }
}

/// Failure to provision one reserved socket
#[derive(Error, Debug)]
#[error("{step} failed: {source}")]
pub struct ProvisionError {
    pub step: ProvisionStep,
    #[source]
    pub source: io::Error,
}

impl ProvisionError {
    pub fn new(step: ProvisionStep, source: io::Error) -> Self {
        Self { step, source }
    }

    pub(crate) fn last_os_error(step: ProvisionStep) -> Self {
        Self::new(step, io::Error::last_os_error())
    }

    /// OS error code, if the failure came from a syscall
    pub fn raw_os_error(&self) -> Option<i32> {
        self.source.raw_os_error()
    }
}
