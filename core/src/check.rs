//! Suspect notifications and their wire format
//!
//! The proxy publishes one line per suspected-dead backend on the `dead`
//! channel: `<frontendKey>;<backendUrl>;<slotIndex>;<groupLength>`. A parsed
//! line becomes a [`Check`], the unit of work handed to the coordination
//! layer and the prober.

use crate::{CheckerError, Result};
use std::fmt;
use std::str::FromStr;

/// One ingested suspect notification
///
/// The slot index is the backend's position in the frontend's backend list on
/// the shared store, offset by one on reads since index 0 holds proxy
/// metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    /// Logical service whose traffic fans out over several backends
    pub frontend_key: String,
    /// Origin URL to probe; primary key of the coordination layer
    pub backend_url: String,
    /// Position of this backend in the frontend's backend list
    pub slot_index: usize,
    /// Number of backends serving the frontend
    pub group_length: usize,
}

impl Check {
    /// Whether the backend is part of a scaled group
    ///
    /// Singleton groups are never checked: with one backend there is nothing
    /// to fail over to, and the proxy keeps routing to it regardless.
    pub fn is_grouped(&self) -> bool {
        self.group_length > 1
    }
}

impl FromStr for Check {
    type Err = CheckerError;

    fn from_str(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let parts: Vec<&str> = trimmed.split(';').collect();
        if parts.len() != 4 {
            return Err(CheckerError::Notification(line.to_string()));
        }
        let slot_index: usize = parts[2]
            .parse()
            .map_err(|_| CheckerError::Notification(line.to_string()))?;
        let group_length: usize = parts[3]
            .parse()
            .map_err(|_| CheckerError::Notification(line.to_string()))?;
        if parts[0].is_empty() || parts[1].is_empty() {
            return Err(CheckerError::Notification(line.to_string()));
        }
        Ok(Check {
            frontend_key: parts[0].to_string(),
            backend_url: parts[1].to_string(),
            slot_index,
            group_length,
        })
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{};{};{}",
            self.frontend_key, self.backend_url, self.slot_index, self.group_length
        )
    }
}
