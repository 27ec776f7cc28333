//! Trust and resource checks applied before a reload builds anything

pub mod limits;
pub mod permissions;

pub use limits::{CapacityError, DescriptorLimit};
pub use permissions::{PermissionError, effective_uid, verify_trusted_file};
