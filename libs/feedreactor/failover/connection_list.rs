//! Ordered connection targets with a wrapping cursor

use crate::core::config::{ConnectOptions, ConnectionTarget};
use crate::failover::warm_standby::group_slots;
use crate::traits::error::{ReactorError, Result};
use std::fmt;

/// Where a target came from in the connect options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetOrigin {
    ConnectionList { index: usize },
    WarmStandby { group: usize, member: usize },
}

impl fmt::Display for TargetOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetOrigin::ConnectionList { index } => write!(f, "connection list #{}", index),
            TargetOrigin::WarmStandby { group, member: 0 } => {
                write!(f, "warm standby group #{} active", group)
            }
            TargetOrigin::WarmStandby { group, member } => {
                write!(f, "warm standby group #{} standby #{}", group, member)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSlot {
    pub target: ConnectionTarget,
    pub origin: TargetOrigin,
}

/// Cursor over every configured target
///
/// Warm standby groups come first (active member, then standbys), followed
/// by the plain connection list. The cursor always points at a valid slot.
#[derive(Debug, Clone)]
pub struct TargetCursor {
    slots: Vec<TargetSlot>,
    index: usize,
}

impl TargetCursor {
    pub fn new(slots: Vec<TargetSlot>) -> Result<Self> {
        if slots.is_empty() {
            return Err(ReactorError::ParameterInvalid(
                "no connection targets configured".to_string(),
            ));
        }
        Ok(Self { slots, index: 0 })
    }

    pub fn from_options(options: &ConnectOptions) -> Result<Self> {
        let mut slots = group_slots(&options.warm_standby_groups);
        slots.extend(
            options
                .connection_list
                .iter()
                .enumerate()
                .map(|(index, target)| TargetSlot {
                    target: target.clone(),
                    origin: TargetOrigin::ConnectionList { index },
                }),
        );
        Self::new(slots)
    }

    pub fn current(&self) -> &TargetSlot {
        &self.slots[self.index]
    }

    pub fn position(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Move to the next target, wrapping at the end
    pub fn advance(&mut self) -> &TargetSlot {
        self.index = (self.index + 1) % self.slots.len();
        self.current()
    }

    /// Jump to a slot; out of range positions are ignored
    pub fn move_to(&mut self, position: usize) -> bool {
        if position < self.slots.len() {
            self.index = position;
            true
        } else {
            false
        }
    }

    pub fn position_of(&self, origin: TargetOrigin) -> Option<usize> {
        self.slots.iter().position(|slot| slot.origin == origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::WarmStandbyGroup;

    fn target(name: &str) -> ConnectionTarget {
        ConnectionTarget::new(name, "14002")
    }

    #[test]
    fn test_wraps_within_list() {
        let options = ConnectOptions::single(target("a"))
            .with_target(target("b"))
            .with_target(target("c"));
        let mut cursor = TargetCursor::from_options(&options).unwrap();
        assert_eq!(cursor.current().target.address, "a");
        assert_eq!(cursor.advance().target.address, "b");
        assert_eq!(cursor.advance().target.address, "c");
        assert_eq!(cursor.advance().target.address, "a");
    }

    #[test]
    fn test_groups_precede_list() {
        let options = ConnectOptions::single(target("list"))
            .with_warm_standby_group(WarmStandbyGroup::new(target("active")).with_standby(target("standby")));
        let cursor = TargetCursor::from_options(&options).unwrap();
        assert_eq!(cursor.len(), 3);
        assert_eq!(
            cursor.current().origin,
            TargetOrigin::WarmStandby { group: 0, member: 0 }
        );
        assert_eq!(
            cursor.position_of(TargetOrigin::ConnectionList { index: 0 }),
            Some(2)
        );
    }

    #[test]
    fn test_empty_rejected() {
        assert!(TargetCursor::new(Vec::new()).is_err());
    }

    #[test]
    fn test_move_to_bounds() {
        let options = ConnectOptions::single(target("a")).with_target(target("b"));
        let mut cursor = TargetCursor::from_options(&options).unwrap();
        assert!(cursor.move_to(1));
        assert!(!cursor.move_to(5));
        assert_eq!(cursor.position(), 1);
    }
}
