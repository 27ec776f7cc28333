//! Address identity for reservations
//!
//! An [`AddressKey`] is the canonical tuple of family, socket type, protocol
//! and raw socket-address bytes. [`parse_line`] turns one configuration line
//! into an [`AddressSpec`].

pub mod key;
pub mod parse;

pub use key::{AddressKey, Family, SocketType, hash_address};
pub use parse::{AddressParseError, AddressSpec, parse_line};
