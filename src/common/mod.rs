//! Common traits and helpers used across the reservd library
//!
//! This module contains the provisioning trait that separates the
//! reservation table from the operating system, plus test utilities shared
//! by unit and integration tests.

pub mod test_utils;
pub mod traits;

pub use test_utils::{ScriptedProvisioner, write_reservations};
pub use traits::Provision;
