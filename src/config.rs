//! Daemon-wide configuration. A plain, `serde`-derived struct with
//! `Default` — no config-file parser lives in this crate; embedding
//! applications load it from whatever format they already use (TOML,
//! YAML, JSON via `serde`) and hand the crate the resulting value.
//! Configuration is not daemon *state*, so it carries no IPC/GC fields.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DaemonError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Fixed cadence of the main loop. `Duration::ZERO` engages the
    /// idle-probability path instead of a fixed sleep.
    pub loop_interval: Duration,
    /// Bernoulli draw probability used to decide idleness when
    /// `loop_interval` is zero.
    pub idle_probability: f64,
    /// If set, the daemon restarts itself once its uptime reaches this
    /// interval (only meaningful when `daemonize` is true).
    pub auto_restart_interval: Option<Duration>,
    /// Minimum uptime before a fatal error is allowed to trigger a
    /// restart.
    pub min_restart_threshold: Duration,
    pub daemonize: bool,
    pub shutdown_on_interrupt: bool,
    pub dump_on_signal: bool,
    /// Lower bound on the CPU yield after an over-run tick.
    pub loop_sleep_min: Duration,
    pub log_overrun: bool,
    pub log_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            loop_interval: Duration::from_secs(1),
            idle_probability: 0.0,
            auto_restart_interval: None,
            min_restart_threshold: Duration::from_secs(60),
            daemonize: false,
            shutdown_on_interrupt: true,
            dump_on_signal: true,
            loop_sleep_min: Duration::from_micros(10),
            log_overrun: true,
            log_path: None,
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<(), DaemonError> {
        if !(0.0..=1.0).contains(&self.idle_probability) {
            return Err(DaemonError::Validation(format!(
                "idle_probability must be within [0, 1], got {}",
                self.idle_probability
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_idle_probability_outside_unit_interval() {
        let mut config = DaemonConfig::default();
        config.idle_probability = 1.5;
        assert!(config.validate().is_err());
        config.idle_probability = 1.0;
        assert!(config.validate().is_ok());
        config.idle_probability = 0.0;
        assert!(config.validate().is_ok());
    }
}
