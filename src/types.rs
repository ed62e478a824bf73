//! Core types for the cell cache
//!
//! ## Table of Contents
//! - **CellId**: Server-assigned identifier for a cell
//! - **CellStatus**: Ordered lifecycle status
//! - **StatusStep**: A single-ordinal status change
//! - **ChangeSource**: Origin of a transform change

use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-assigned identifier for a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellId(u64);

impl CellId {
    /// Create a CellId from a u64
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell-{}", self.0)
    }
}

impl From<u64> for CellId {
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

/// Lifecycle status of a cell, ordered by increasing resource commitment.
///
/// - `Disk`: no memory footprint beyond the cache entry
/// - `Bounded`: bounds known, no content loaded
/// - `Inactive`: all cell data in memory
/// - `Active`: within the viewer's proximity
/// - `Visible`: within the view frustum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CellStatus {
    /// Lowest level; reaching it through a decrease releases the cell
    Disk = 0,
    /// Bounds initialised
    Bounded = 1,
    /// Data resident
    Inactive = 2,
    /// Near the viewer
    Active = 3,
    /// In view
    Visible = 4,
}

impl CellStatus {
    /// All statuses in ascending order
    pub const ALL: [CellStatus; 5] = [
        CellStatus::Disk,
        CellStatus::Bounded,
        CellStatus::Inactive,
        CellStatus::Active,
        CellStatus::Visible,
    ];

    /// Ordinal position (Disk = 0)
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Status for an ordinal, if in range
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }

    /// The next status up, if any
    pub fn up(self) -> Option<Self> {
        Self::from_ordinal(self.ordinal() + 1)
    }

    /// The next status down, if any
    pub fn down(self) -> Option<Self> {
        self.ordinal().checked_sub(1).and_then(Self::from_ordinal)
    }

    /// Single-ordinal steps leading from `self` to `target`, in order
    pub fn path_to(self, target: CellStatus) -> Vec<StatusStep> {
        let mut steps = Vec::new();
        let mut current = self;
        while current != target {
            let next = if target > current { current.up() } else { current.down() };
            match next {
                Some(next) => {
                    steps.push(StatusStep { from: current, to: next });
                    current = next;
                }
                None => break,
            }
        }
        steps
    }
}

impl fmt::Display for CellStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CellStatus::Disk => "DISK",
            CellStatus::Bounded => "BOUNDS",
            CellStatus::Inactive => "INACTIVE",
            CellStatus::Active => "ACTIVE",
            CellStatus::Visible => "VISIBLE",
        };
        f.write_str(name)
    }
}

impl Default for CellStatus {
    fn default() -> Self {
        Self::Disk
    }
}

/// A single-ordinal lifecycle step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusStep {
    /// Status before the step
    pub from: CellStatus,
    /// Status after the step
    pub to: CellStatus,
}

impl StatusStep {
    /// Whether the step raises the commitment level
    pub fn is_advance(&self) -> bool {
        self.to > self.from
    }
}

impl fmt::Display for StatusStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Where a transform change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    /// Initiated on this client
    Local,
    /// Initiated by another client, relayed by the server
    Remote,
    /// Server correction of client state
    ServerAdjust,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ordering() {
        assert!(CellStatus::Disk < CellStatus::Bounded);
        assert!(CellStatus::Active < CellStatus::Visible);
        assert_eq!(CellStatus::Visible.up(), None);
        assert_eq!(CellStatus::Disk.down(), None);
        assert_eq!(CellStatus::from_ordinal(2), Some(CellStatus::Inactive));
        assert_eq!(CellStatus::from_ordinal(5), None);
    }

    #[test]
    fn test_path_up_and_down() {
        let up = CellStatus::Disk.path_to(CellStatus::Visible);
        assert_eq!(up.len(), 4);
        assert!(up.iter().all(StatusStep::is_advance));
        assert_eq!(up[0], StatusStep { from: CellStatus::Disk, to: CellStatus::Bounded });
        assert_eq!(up[3].to, CellStatus::Visible);

        let down = CellStatus::Active.path_to(CellStatus::Bounded);
        assert_eq!(
            down,
            vec![
                StatusStep { from: CellStatus::Active, to: CellStatus::Inactive },
                StatusStep { from: CellStatus::Inactive, to: CellStatus::Bounded },
            ]
        );

        assert!(CellStatus::Inactive.path_to(CellStatus::Inactive).is_empty());
    }

    #[test]
    fn test_cell_id_display() {
        assert_eq!(CellId::new(42).to_string(), "cell-42");
        assert_eq!(CellId::from(9).as_u64(), 9);
    }
}
