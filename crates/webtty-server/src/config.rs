use std::env;
use std::time::Duration;

pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
pub const DEFAULT_HISTORY_BUFFER_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HISTORY_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Tuning knobs for the terminal manager.
///
/// `Default` carries the shipped defaults; callers override individual
/// fields and pass the result through [`TerminalConfig::normalized`], which
/// replaces degenerate values. `max_connections`, `history_max_records` and
/// `history_max_age` treat zero as "disabled" rather than degenerate.
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    /// Shell program spawned for every session.
    pub shell: String,
    /// Frame buffer for one read-and-broadcast iteration.
    pub buffer_size: usize,
    /// Global cap on concurrent viewers; 0 = unlimited.
    pub max_connections: i64,
    /// Capacity of the in-memory scrollback ring.
    pub history_buffer_size: usize,
    /// Period of the history flush ticker.
    pub history_flush_interval: Duration,
    /// Durable chunks retained per session; 0 disables pruning.
    pub history_max_records: i64,
    /// Age cutoff for expired-history cleanup; zero disables.
    pub history_max_age: Duration,
    /// Bounded wait for the child to die on close.
    pub close_timeout: Duration,
}

pub fn default_shell() -> String {
    env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_connections: 0,
            history_buffer_size: DEFAULT_HISTORY_BUFFER_SIZE,
            history_flush_interval: DEFAULT_FLUSH_INTERVAL,
            history_max_records: 1,
            history_max_age: DEFAULT_HISTORY_MAX_AGE,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl TerminalConfig {
    /// Replace degenerate values with their defaults.
    ///
    /// A buffer of 4 bytes or less cannot carry a tag plus one base64
    /// quantum, and a ring without capacity cannot hold scrollback.
    pub fn normalized(mut self) -> Self {
        if self.shell.is_empty() {
            self.shell = default_shell();
        }
        if self.buffer_size <= 4 {
            self.buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if self.history_buffer_size == 0 {
            self.history_buffer_size = DEFAULT_HISTORY_BUFFER_SIZE;
        }
        if self.history_flush_interval.is_zero() {
            self.history_flush_interval = DEFAULT_FLUSH_INTERVAL;
        }
        if self.close_timeout.is_zero() {
            self.close_timeout = DEFAULT_CLOSE_TIMEOUT;
        }
        if self.max_connections < 0 {
            self.max_connections = 0;
        }
        if self.history_max_records < 0 {
            self.history_max_records = 1;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipped_values() {
        let cfg = TerminalConfig::default();
        assert_eq!(cfg.buffer_size, 32 * 1024);
        assert_eq!(cfg.history_buffer_size, 10 * 1024 * 1024);
        assert_eq!(cfg.history_flush_interval, Duration::from_secs(5));
        assert_eq!(cfg.history_max_records, 1);
        assert_eq!(cfg.history_max_age, Duration::from_secs(7 * 24 * 60 * 60));
        assert_eq!(cfg.max_connections, 0);
    }

    #[test]
    fn normalized_clamps_degenerate_values() {
        let cfg = TerminalConfig {
            shell: String::new(),
            buffer_size: 4,
            history_buffer_size: 0,
            history_flush_interval: Duration::ZERO,
            max_connections: -3,
            history_max_records: -1,
            ..TerminalConfig::default()
        }
        .normalized();

        assert!(!cfg.shell.is_empty());
        assert_eq!(cfg.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(cfg.history_buffer_size, DEFAULT_HISTORY_BUFFER_SIZE);
        assert_eq!(cfg.history_flush_interval, DEFAULT_FLUSH_INTERVAL);
        assert_eq!(cfg.max_connections, 0);
        assert_eq!(cfg.history_max_records, 1);
    }

    #[test]
    fn normalized_keeps_explicit_disables() {
        let cfg = TerminalConfig {
            history_max_records: 0,
            history_max_age: Duration::ZERO,
            ..TerminalConfig::default()
        }
        .normalized();

        assert_eq!(cfg.history_max_records, 0);
        assert!(cfg.history_max_age.is_zero());
    }
}
