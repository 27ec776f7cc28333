use thiserror::Error;

/// Error types for the reservd library
#[derive(Error, Debug)]
pub enum ReservedError {
    /// A reservation request or configuration line could not be parsed
    #[error("Parse error: {0}")]
    Parse(#[from] address::AddressParseError),

    /// Creating or binding a reserved socket failed
    #[error("Provision error: {0}")]
    Provision(#[from] provision::ProvisionError),

    /// A reload was aborted and the published table left as it was
    #[error("Reload error: {0}")]
    Reload(#[from] reload::ReloadError),

    /// Other I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for the reservd library
pub type Result<T> = std::result::Result<T, ReservedError>;

pub mod address;
pub mod common;
pub mod provision;
pub mod reload;
pub mod security;
pub mod table;

// Re-export main types for convenience
pub use address::{AddressKey, AddressSpec, Family, SocketType, parse_line};
pub use common::Provision;
pub use provision::{ReservedSocket, SocketHandle, SystemProvisioner};
pub use reload::{
    ReloadConfig, ReloadError, ReloadOutcome, ReloadPhase, ReloadTrigger, Reservations,
    spawn_reloader,
};
pub use table::{BuildStats, Generation, Lookup, Reservation};
