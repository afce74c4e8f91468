//! Serializable station views.
//!
//! These types are `no_std` compatible. The runner hands them out on
//! request and the simulator prints them as JSON.
//!
//! # Example
//!
//! ```
//! use twpc_rail::config::Config;
//! use twpc_rail::hal::MockLines;
//! use twpc_rail::Station;
//!
//! let station = Station::new(&Config::default(), MockLines::new());
//! let snapshot = station.snapshot();
//! assert!(snapshot.devices.is_empty());
//! assert!(snapshot.enumeration_enabled);
//!
//! #[cfg(feature = "std")]
//! {
//!     let json = serde_json::to_string(&snapshot).unwrap();
//!     assert!(json.contains(r#""state":"accepting_connections""#));
//! }
//! ```

use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::device_table::{DeviceEntry, DeviceKind};
use crate::master::{FaultRecord, MasterState};
use crate::packet::MAX_DEVICE_ID;
use crate::scan::{ScanStats, MAX_CONTACT_LINES};

// ============================================================================
// Devices
// ============================================================================

/// One row of the device table.
///
/// # JSON Example
///
/// ```json
/// {"id": 1, "kind": "train", "identity": [65, 83, 68], "ready": true, "pending_command": null}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Bus id
    pub id: u8,
    /// Reported device type
    pub kind: DeviceKind,
    /// Identity bytes collected during the handshake
    pub identity: [u8; 3],
    /// Handshake finished
    pub ready: bool,
    /// Command waiting for the next poll
    pub pending_command: Option<u8>,
}

impl From<&DeviceEntry> for DeviceSnapshot {
    fn from(entry: &DeviceEntry) -> Self {
        Self {
            id: entry.id,
            kind: entry.kind,
            identity: entry.identity,
            ready: entry.is_ready(),
            pending_command: entry.pending_command,
        }
    }
}

// ============================================================================
// Station
// ============================================================================

/// Contact scanner state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSnapshot {
    /// Counters
    pub stats: ScanStats,
    /// Last id seen per line, 0 when none
    pub last_seen: Vec<u8, MAX_CONTACT_LINES>,
}

/// Everything the host may want to display about the station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationSnapshot {
    /// Master state
    pub state: MasterState,
    /// Id polled next, 0 when none
    pub cursor: u8,
    /// Enumeration round pending or running
    pub enumeration_enabled: bool,
    /// Connected devices in id order
    pub devices: Vec<DeviceSnapshot, { MAX_DEVICE_ID as usize }>,
    /// Most recent fault
    pub last_fault: Option<FaultRecord>,
    /// Broadcasts waiting to go out
    pub queued_broadcasts: usize,
    /// Scanner state, absent when scanning is disabled
    pub scan: Option<ScanSnapshot>,
    /// Ticks since start-up
    pub ticks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_table::DeviceTable;

    #[test]
    fn device_snapshot_json() {
        let mut table = DeviceTable::new();
        table.seed(4);
        let snapshot = DeviceSnapshot::from(table.get(4).unwrap());
        let json = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(
            json,
            r#"{"id":4,"kind":"unspecified","identity":[0,0,0],"ready":false,"pending_command":16}"#
        );
        let back: DeviceSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
