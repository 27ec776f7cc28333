use super::{LineError, ReloadConfig, ReloadError};
use crate::address::parse_line;
use crate::security::verify_trusted_file;
use crate::table::Reservation;
use std::fs::File;
use std::io::{self, Read};
use tracing::{debug, error};

/// Reads and parses the reservation file
///
/// A missing file means no reservations. Every malformed line is logged and
/// collected before giving up, so one reload reports all of them.
pub(crate) fn scan(config: &ReloadConfig) -> Result<Vec<Reservation>, ReloadError> {
    let path = &config.path;
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No reservation file, nothing reserved");
            return Ok(Vec::new());
        }
        Err(source) => return Err(config_access(config, source)),
    };

    let meta = file.metadata().map_err(|e| config_access(config, e))?;
    verify_trusted_file(&meta, config.owner()).map_err(|reason| {
        error!(path = %path.display(), os_error = libc::EPERM, %reason, "Ownership/permissions incorrect");
        ReloadError::Permissions {
            path: path.clone(),
            reason,
        }
    })?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| config_access(config, e))?;

    let mut reservations = Vec::new();
    let mut errors = Vec::new();
    for (index, raw) in contents.lines().enumerate() {
        let line = index + 1;
        let text = raw.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        match parse_line(text) {
            Ok(spec) => reservations.push(Reservation::new(line, spec.into_key())),
            Err(e) => {
                error!(path = %path.display(), line, os_error = libc::EINVAL, error = %e, "Error parsing reservation");
                errors.push(LineError { line, error: e });
            }
        }
    }
    if !errors.is_empty() {
        return Err(ReloadError::Parse {
            path: path.clone(),
            errors,
        });
    }

    config.limit().validate_count(reservations.len()).map_err(|e| {
        error!(path = %path.display(), os_error = libc::EINVAL, error = %e, "Too many reservations");
        ReloadError::Capacity {
            path: path.clone(),
            source: e,
        }
    })?;

    debug!(path = %path.display(), count = reservations.len(), "Scanned reservation file");
    Ok(reservations)
}

fn config_access(config: &ReloadConfig, source: io::Error) -> ReloadError {
    error!(path = %config.path.display(), os_error = source.raw_os_error(), error = %source, "Cannot read reservation file");
    ReloadError::ConfigAccess {
        path: config.path.clone(),
        source,
    }
}
