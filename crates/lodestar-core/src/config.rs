//! Engine configuration.

use std::time::Duration;

/// Delay between `idle` and ending the execution.
///
/// Trailing console fragments can arrive a few milliseconds after the idle
/// message; they must still be attributed to the run that produced them.
pub const DEFAULT_FINALIZE_DELAY: Duration = Duration::from_millis(50);

/// Host flag that enables "run stale cells" affordances.
pub const DEFAULT_STALE_FLAG: &str = "lodestar.hasStaleCells";

/// Capacity of the engine command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the staleness change broadcast.
/// Slow subscribers lose the oldest changes, never the latest.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deferred-finalize delay after `idle`.
    pub finalize_delay: Duration,
    /// Capacity of the command channel behind [`EngineHandle`](crate::EngineHandle).
    pub command_capacity: usize,
    /// Capacity of the staleness change broadcast.
    pub change_capacity: usize,
    /// Name of the host UI flag mirroring "active notebook has stale cells".
    pub stale_flag: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            finalize_delay: DEFAULT_FINALIZE_DELAY,
            command_capacity: COMMAND_CHANNEL_CAPACITY,
            change_capacity: CHANGE_CHANNEL_CAPACITY,
            stale_flag: DEFAULT_STALE_FLAG.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn with_finalize_delay(mut self, delay: Duration) -> Self {
        self.finalize_delay = delay;
        self
    }

    pub fn with_stale_flag(mut self, flag: impl Into<String>) -> Self {
        self.stale_flag = flag.into();
        self
    }

    pub fn with_change_capacity(mut self, capacity: usize) -> Self {
        self.change_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.finalize_delay, Duration::from_millis(50));
        assert_eq!(config.stale_flag, "lodestar.hasStaleCells");
        assert!(config.command_capacity > 0);
    }

    #[test]
    fn test_change_capacity_never_zero() {
        let config = EngineConfig::default().with_change_capacity(0);
        assert_eq!(config.change_capacity, 1);
    }
}
