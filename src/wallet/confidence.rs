//! Transaction confidence: where a transaction stands relative to the
//! best chain.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::primitives::Sha256dHash;

/// Confidence state machine. Depth grows monotonically while the best
/// chain extends and may regress (to `Pending`) across a reorg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    /// Included in the best chain. Depth 1 means "in the tip block".
    Building { height: u32, depth: u32 },
    /// Seen in the mempool (or demoted by a reorg), not yet mined.
    Pending,
    /// A conflicting transaction spent one of its inputs and confirmed.
    Dead { overridden_by: Sha256dHash },
    /// Nothing known yet.
    Unknown,
}

impl Confidence {
    pub fn is_building(&self) -> bool {
        matches!(self, Confidence::Building { .. })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Confidence::Pending)
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, Confidence::Dead { .. })
    }

    pub fn depth(&self) -> u32 {
        match self {
            Confidence::Building { depth, .. } => *depth,
            _ => 0,
        }
    }

    pub fn height(&self) -> Option<u32> {
        match self {
            Confidence::Building { height, .. } => Some(*height),
            _ => None,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Building { height, depth } => {
                write!(f, "building (height {}, depth {})", height, depth)
            }
            Confidence::Pending => write!(f, "pending"),
            Confidence::Dead { overridden_by } => write!(f, "dead (overridden by {})", overridden_by),
            Confidence::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        let building = Confidence::Building {
            height: 100,
            depth: 3,
        };
        assert!(building.is_building());
        assert_eq!(building.depth(), 3);
        assert_eq!(building.height(), Some(100));

        assert_eq!(Confidence::Pending.depth(), 0);
        assert!(Confidence::Dead {
            overridden_by: Sha256dHash::zero()
        }
        .is_dead());
    }
}
