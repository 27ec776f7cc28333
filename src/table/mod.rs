//! The reserved address table
//!
//! A [`Generation`] maps [`AddressKey`]s to bound sockets. Generations are
//! built once and then only read, except for the handle cell of each entry
//! which [`rebind`] may replace.

pub mod generation;
pub mod rebind;

#[cfg(test)]
mod tests;

pub use generation::Generation;

use crate::address::{AddressKey, AddressSpec};
use crate::provision::SocketHandle;
use thiserror::Error;

/// Result of a table lookup
#[derive(Debug, Clone)]
pub enum Lookup {
    /// The address is reserved and its socket is held
    Bound(SocketHandle),
    /// The address is reserved but no socket could be bound for it
    Absent,
    /// The address is not reserved
    NotFound,
}

impl Lookup {
    pub fn handle(&self) -> Option<&SocketHandle> {
        match self {
            Lookup::Bound(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn into_handle(self) -> Option<SocketHandle> {
        match self {
            Lookup::Bound(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn is_found(&self) -> bool {
        !matches!(self, Lookup::NotFound)
    }
}

/// One configured reservation and the configuration line it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub line: usize,
    pub key: AddressKey,
}

impl Reservation {
    pub fn new(line: usize, key: AddressKey) -> Self {
        Self { line, key }
    }

    /// Numbers specs by their position, starting at line 1
    pub fn numbered(specs: impl IntoIterator<Item = AddressSpec>) -> Vec<Reservation> {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| Reservation::new(i + 1, spec.into_key()))
            .collect()
    }
}

/// Counters recorded while building a generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Handles taken over from the previous generation
    pub carried: usize,
    /// Sockets newly bound for this generation
    pub provisioned: usize,
    /// Reservations left absent because provisioning failed
    pub failed: usize,
    /// Lines that repeated an earlier address
    pub duplicates: usize,
}

/// A build was cancelled before it finished
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("generation build cancelled")]
pub struct BuildCancelled;
