//! Error taxonomy for the management core

use std::io;
use thiserror::Error;

/// Errors surfaced by [`Management`](crate::Management) and the entities it owns.
///
/// Logical failures (`Validation`, `Conflict`, `NotFound`, `Precondition`) are
/// raised before any state is touched, so a failed call never half-applies.
#[derive(Debug, Error)]
pub enum ManagementError {
    /// A required argument is empty or out of range.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Duplicate name or duplicate bound endpoint.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unknown server or association name.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation is illegal in the current lifecycle state.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Socket, multiplexer or persistence fault.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<serde_json::Error> for ManagementError {
    fn from(err: serde_json::Error) -> Self {
        Self::Io(io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

/// Result type for management operations
pub type Result<T> = std::result::Result<T, ManagementError>;

pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ManagementError::Validation(format!("{field} cannot be empty")));
    }
    Ok(())
}

pub(crate) fn require_port(field: &str, port: u16) -> Result<()> {
    if port < 1 {
        return Err(ManagementError::Validation(format!("{field} cannot be less than 1")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ManagementError::Conflict("Server name=S1 already exists".into());
        assert!(err.to_string().contains("Conflict"));
        assert!(err.to_string().contains("S1"));

        let io_err = ManagementError::Io(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(io_err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_validation_helpers() {
        assert!(require_non_empty("Server name", "S1").is_ok());
        assert!(matches!(
            require_non_empty("Server name", "  "),
            Err(ManagementError::Validation(_))
        ));
        assert!(require_port("Peer port", 2905).is_ok());
        assert!(matches!(require_port("Peer port", 0), Err(ManagementError::Validation(_))));
    }

    #[test]
    fn test_serde_error_maps_to_io() {
        let parse_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: ManagementError = parse_err.into();
        assert!(matches!(err, ManagementError::Io(ref e) if e.kind() == io::ErrorKind::InvalidData));
    }
}
