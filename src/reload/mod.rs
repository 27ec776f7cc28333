//! Loading and hot-reloading the reservation table
//!
//! A reload scans the reservation file, builds the next generation from the
//! current one, publishes it with a single pointer swap, waits out the
//! quiescence delay and then retires the generation it replaced. Any failure
//! before the swap leaves the published generation exactly as it was.
//!
//! # Examples
//!
//! ```no_run
//! use reservd::reload::{ReloadConfig, Reservations, spawn_reloader};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let reservations = Arc::new(Reservations::new(ReloadConfig::new("/etc/reservd.conf")));
//!     let shutdown = CancellationToken::new();
//!     reservations.reload(&shutdown).await?;
//!
//!     let (trigger, reloader) = spawn_reloader(reservations.clone(), shutdown.clone());
//!     trigger.trigger_reload();
//!     shutdown.cancel();
//!     reloader.await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod driver;
mod scan;


pub use config::ReloadConfig;
pub use driver::{ReloadTrigger, Reservations, spawn_reloader};

use crate::address::AddressParseError;
use crate::security::{CapacityError, PermissionError};
use crate::table::BuildStats;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A reload that was aborted; the published generation is unchanged
#[derive(Error, Debug)]
pub enum ReloadError {
    #[error("cannot read {}: {source}", .path.display())]
    ConfigAccess {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("ownership/permissions incorrect on {}: {reason}", .path.display())]
    Permissions {
        path: PathBuf,
        reason: PermissionError,
    },

    #[error("{} malformed line(s) in {}", .errors.len(), .path.display())]
    Parse {
        path: PathBuf,
        errors: Vec<LineError>,
    },

    #[error("too many entries in {}: {source}", .path.display())]
    Capacity {
        path: PathBuf,
        #[source]
        source: CapacityError,
    },

    #[error("another reload is already in progress")]
    Race,

    #[error("reload cancelled before publishing")]
    Cancelled,

    #[error("reload task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A malformed line of the reservation file
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {error}")]
pub struct LineError {
    pub line: usize,
    #[source]
    pub error: AddressParseError,
}

/// What a successful reload did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The configured set matched the published generation; nothing changed
    Unchanged { generation: u64 },
    /// A new generation was published and its predecessor retired
    Published {
        generation: u64,
        reserved: usize,
        stats: BuildStats,
        released: usize,
    },
}

/// Where the reload driver currently is
///
/// Only the phases a reload can be observed in are tracked. A reload that
/// publishes ends as [`ReloadOutcome::Published`] (or `Unchanged` when the
/// file matched) and one that aborts ends with a [`ReloadError`]; either way
/// the phase returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReloadPhase {
    Idle = 0,
    Scanning = 1,
    Building = 2,
    Quiescing = 3,
}

impl ReloadPhase {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ReloadPhase::Scanning,
            2 => ReloadPhase::Building,
            3 => ReloadPhase::Quiescing,
            _ => ReloadPhase::Idle,
        }
    }
}
