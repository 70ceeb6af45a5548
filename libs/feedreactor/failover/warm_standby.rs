//! Warm standby groups
//!
//! A group is served as one logical channel. The cursor visits the starting
//! active server first; when the active fails, the next standby is promoted.
//!
//! Standbys are cold: only the active member holds a connection. Promotion
//! connects to the next member and runs the full handshake and session
//! setup before open requests are replayed.

use crate::core::config::WarmStandbyGroup;
use crate::failover::connection_list::{TargetOrigin, TargetSlot};
use tracing::info;

/// Flatten groups into cursor slots, active member first
pub fn group_slots(groups: &[WarmStandbyGroup]) -> Vec<TargetSlot> {
    let mut slots = Vec::new();
    for (group, wsb) in groups.iter().enumerate() {
        let members = std::iter::once(&wsb.starting_active).chain(wsb.standby.iter());
        for (member, target) in members.enumerate() {
            slots.push(TargetSlot {
                target: target.clone(),
                origin: TargetOrigin::WarmStandby { group, member },
            });
        }
    }
    slots
}

/// Which member of which group currently serves as active
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmStandbyState {
    active: Option<(usize, usize)>,
    promotions: u32,
}

impl WarmStandbyState {
    pub fn active(&self) -> Option<(usize, usize)> {
        self.active
    }

    pub fn promotions(&self) -> u32 {
        self.promotions
    }

    /// Record that a connection to `origin` was established
    ///
    /// Returns true when a standby took over from a different member of the
    /// same group.
    pub fn on_connected(&mut self, origin: TargetOrigin) -> bool {
        let TargetOrigin::WarmStandby { group, member } = origin else {
            self.active = None;
            return false;
        };

        let promoted = matches!(self.active, Some((g, m)) if g == group && m != member);
        if promoted {
            self.promotions += 1;
            info!(
                "Warm standby group #{}: member #{} promoted to active",
                group, member
            );
        }
        self.active = Some((group, member));
        promoted
    }
}
