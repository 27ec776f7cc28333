use crate::security::{DescriptorLimit, effective_uid};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for loading and hot-reloading the reservation table
///
/// # Examples
///
/// ```
/// use reservd::reload::ReloadConfig;
/// use std::time::Duration;
///
/// let config = ReloadConfig::new("/etc/reservd.conf")
///     .with_quiescence(Duration::from_millis(500));
/// assert_eq!(config.quiescence, Duration::from_millis(500));
/// ```
#[derive(Debug, Clone)]
pub struct ReloadConfig {
    /// Reservation file, one address per line
    pub path: PathBuf,
    /// Delay between publishing a generation and retiring the one it replaced
    pub quiescence: Duration,
    /// Uid the reservation file must be owned by (defaults to the effective uid)
    pub expected_owner: Option<u32>,
    /// Largest number of reservations accepted (defaults to `_SC_OPEN_MAX`)
    pub max_reservations: Option<usize>,
}

impl ReloadConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            quiescence: Duration::from_secs(1),
            expected_owner: None,
            max_reservations: None,
        }
    }

    /// Set the quiescence delay
    pub fn with_quiescence(mut self, quiescence: Duration) -> Self {
        self.quiescence = quiescence;
        self
    }

    /// Require the reservation file to be owned by `uid`
    pub fn with_expected_owner(mut self, uid: u32) -> Self {
        self.expected_owner = Some(uid);
        self
    }

    /// Cap the number of reservations below the descriptor limit
    pub fn with_max_reservations(mut self, max: usize) -> Self {
        self.max_reservations = Some(max);
        self
    }

    pub(crate) fn owner(&self) -> u32 {
        self.expected_owner.unwrap_or_else(effective_uid)
    }

    pub(crate) fn limit(&self) -> DescriptorLimit {
        let process = DescriptorLimit::from_process();
        match self.max_reservations {
            Some(max) => DescriptorLimit::new(max.min(process.max())),
            None => process,
        }
    }
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self::new("/etc/reservd.conf")
    }
}
