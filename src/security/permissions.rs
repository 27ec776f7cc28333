use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use thiserror::Error;

/// Mode bits that let someone other than the owner rewrite the file
const GROUP_OR_OTHER_WRITE: u32 = (libc::S_IWGRP | libc::S_IWOTH) as u32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PermissionError {
    #[error("owned by uid {actual}, expected uid {expected}")]
    Owner { actual: u32, expected: u32 },

    #[error("mode {mode:o} is writable by group or other")]
    Writable { mode: u32 },
}

/// Effective uid of this process
pub fn effective_uid() -> u32 {
    // Safety: geteuid cannot fail
    unsafe { libc::geteuid() }
}

/// Checks that a trusted file is owned by `expected_uid` and not group/other writable
pub fn verify_trusted_file(meta: &Metadata, expected_uid: u32) -> Result<(), PermissionError> {
    if meta.uid() != expected_uid {
        return Err(PermissionError::Owner {
            actual: meta.uid(),
            expected: expected_uid,
        });
    }
    let mode = meta.mode() & 0o7777;
    if mode & GROUP_OR_OTHER_WRITE != 0 {
        return Err(PermissionError::Writable { mode });
    }
    Ok(())
}
