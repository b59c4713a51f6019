//! Manual remote control of zones.
//!
//! A remote ON takes a zone away from the schedule until an explicit OFF or
//! until the blocking timeout expires. The mapping holds the timestamp of the
//! accepted ON command; expiry is evaluated lazily when queried.

use chrono::{DateTime, Duration, Local};
use std::collections::HashMap;
use tracing::info;

/// Parsed remote command payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ZoneCommand {
    On,
    Off,
}

#[derive(Default)]
pub(crate) struct OverrideManager {
    blocked: HashMap<String, DateTime<Local>>,
}

impl OverrideManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record the override bookkeeping for an accepted command. Actuation is
    /// the caller's job; this only tracks the block.
    pub(crate) fn apply_command(&mut self, zone: &str, command: ZoneCommand, now: DateTime<Local>) {
        match command {
            ZoneCommand::On => {
                self.blocked.insert(zone.to_string(), now);
            }
            ZoneCommand::Off => {
                self.blocked.remove(zone);
            }
        }
    }

    /// Whether schedule control of the zone is currently suppressed. An
    /// expired entry is removed on the spot and the force-unblock logged.
    pub(crate) fn is_blocked(
        &mut self,
        zone: &str,
        blocking_timeout_minutes: i64,
        now: DateTime<Local>,
    ) -> bool {
        let Some(&since) = self.blocked.get(zone) else {
            return false;
        };
        if now - since <= Duration::minutes(blocking_timeout_minutes) {
            true
        } else {
            self.blocked.remove(zone);
            info!(
                zone,
                blocking_timeout_minutes, "manual override expired — zone returned to schedule"
            );
            false
        }
    }

    pub(crate) fn contains(&self, zone: &str) -> bool {
        self.blocked.contains_key(zone)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
