use thiserror::Error;

/// Upper bound on how many reservations one table may hold
///
/// Every reservation pins a descriptor, so the table can never usefully grow
/// past the process's descriptor-table size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorLimit {
    max: usize,
}

impl DescriptorLimit {
    pub fn new(max: usize) -> Self {
        Self { max }
    }

    /// Limit taken from `sysconf(_SC_OPEN_MAX)`
    pub fn from_process() -> Self {
        // Safety: sysconf has no memory-safety preconditions
        let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
        // -1 means the limit is indeterminate
        Self::new(usize::try_from(max).unwrap_or(usize::MAX))
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn validate_count(&self, count: usize) -> Result<(), CapacityError> {
        if count > self.max {
            Err(CapacityError::TooMany {
                count,
                max: self.max,
            })
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapacityError {
    #[error("{count} reservations exceed the descriptor limit of {max}")]
    TooMany { count: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_limit_is_positive() {
        assert!(DescriptorLimit::from_process().max() > 0);
    }

    #[test]
    fn test_validate_count() {
        let limit = DescriptorLimit::new(2);

        assert!(limit.validate_count(0).is_ok());
        assert!(limit.validate_count(2).is_ok());
        assert_eq!(
            limit.validate_count(3),
            Err(CapacityError::TooMany { count: 3, max: 2 })
        );
    }
}
