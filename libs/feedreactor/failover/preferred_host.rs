//! Preferred host fallback
//!
//! When a channel ends up on a target other than the preferred one, it can
//! fall back to the preferred target either on a detection timer or on
//! demand.

use crate::core::config::PreferredHostOptions;
use crate::failover::connection_list::{TargetCursor, TargetOrigin};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct PreferredHost {
    options: PreferredHostOptions,
    preferred_position: Option<usize>,
    fallback_in_progress: bool,
}

impl PreferredHost {
    pub fn new(options: PreferredHostOptions, cursor: &TargetCursor, has_groups: bool) -> Self {
        let preferred_position = if options.enabled {
            let origin = if has_groups {
                TargetOrigin::WarmStandby {
                    group: options.warm_standby_group_index,
                    member: 0,
                }
            } else {
                TargetOrigin::ConnectionList {
                    index: options.connection_list_index,
                }
            };
            cursor.position_of(origin)
        } else {
            None
        };
        Self {
            options,
            preferred_position,
            fallback_in_progress: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.preferred_position.is_some()
    }

    pub fn preferred_position(&self) -> Option<usize> {
        self.preferred_position
    }

    /// Connected somewhere other than the preferred target
    pub fn needs_fallback(&self, current_position: usize) -> bool {
        matches!(self.preferred_position, Some(p) if p != current_position)
    }

    /// Interval of the automatic check, if one is configured
    pub fn detection_interval(&self) -> Option<Duration> {
        if self.is_enabled() && self.options.detection_interval_ms > 0 {
            Some(Duration::from_millis(self.options.detection_interval_ms))
        } else {
            None
        }
    }

    /// Mark a fallback as started; returns the target position to use
    pub fn begin_fallback(&mut self) -> Option<usize> {
        let position = self.preferred_position?;
        self.fallback_in_progress = true;
        Some(position)
    }

    pub fn fallback_in_progress(&self) -> bool {
        self.fallback_in_progress
    }

    /// Finish a fallback once the channel is ready on the preferred target
    pub fn complete_if_preferred(&mut self, current_position: usize) -> bool {
        if self.fallback_in_progress && self.preferred_position == Some(current_position) {
            self.fallback_in_progress = false;
            return true;
        }
        false
    }

    /// Abandon a fallback that did not reach the preferred target
    pub fn abandon(&mut self) {
        self.fallback_in_progress = false;
    }
}
