//! The `/daemon` config section.

use std::time::Duration;

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DaemonConfig {
    /// `None` disables the periodic resync tick.
    pub resync_interval: Option<Duration>,
}

impl DaemonConfig {
    /// `daemon.resync_interval_secs`; 0 or absent disables the tick.
    pub fn from_config_json(config: &Value) -> Self {
        let resync_interval = config
            .pointer("/daemon/resync_interval_secs")
            .and_then(Value::as_u64)
            .filter(|&s| s > 0)
            .map(Duration::from_secs);
        Self { resync_interval }
    }
}
