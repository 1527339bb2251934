//! Ambient pool configuration, loaded from TOML the way the wider example
//! pack's settings structs are: a plain `serde::Deserialize` struct with a
//! hand-written `Default` matching the documented defaults, not something the
//! core parses itself out of a `ConfSection`.

use serde::Deserialize;

/// Comparator mode for [`crate::queue::RequestQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePriority {
    Default,
    Time,
    Eap,
}

impl Default for QueuePriority {
    fn default() -> Self {
        QueuePriority::Default
    }
}

/// The thread-pool configuration options table from §6, with the same
/// field names and defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub start_servers: usize,
    pub max_servers: usize,
    pub min_spare_servers: usize,
    pub max_spare_servers: usize,
    /// `0` means unlimited.
    pub max_requests_per_server: u64,
    pub cleanup_delay_secs: u64,
    pub max_queue_size: usize,
    pub queue_priority: QueuePriority,
    pub auto_limit_acct: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            start_servers: 5,
            max_servers: 32,
            min_spare_servers: 3,
            max_spare_servers: 10,
            max_requests_per_server: 0,
            cleanup_delay_secs: 5,
            max_queue_size: 65536,
            queue_priority: QueuePriority::Default,
            auto_limit_acct: false,
        }
    }
}

impl PoolConfig {
    /// Parse a `PoolConfig` from a TOML document, falling back to [`Default`]
    /// for any field the document omits.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// `max_queue_size` must be in `[2, 1_048_576]` per §4.5.
    pub fn validate(&self) -> Result<(), crate::error::CoreError> {
        if !(2..=1_048_576).contains(&self.max_queue_size) {
            return Err(crate::error::CoreError::Config {
                message: format!(
                    "max_queue_size {} out of range [2, 1048576]",
                    self.max_queue_size
                ),
            });
        }
        if self.min_spare_servers > self.max_spare_servers {
            return Err(crate::error::CoreError::Config {
                message: "min_spare_servers must be <= max_spare_servers".into(),
            });
        }
        if self.start_servers > self.max_servers {
            return Err(crate::error::CoreError::Config {
                message: "start_servers must be <= max_servers".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_table() {
        let c = PoolConfig::default();
        assert_eq!(c.start_servers, 5);
        assert_eq!(c.max_servers, 32);
        assert_eq!(c.min_spare_servers, 3);
        assert_eq!(c.max_spare_servers, 10);
        assert_eq!(c.max_requests_per_server, 0);
        assert_eq!(c.cleanup_delay_secs, 5);
        assert_eq!(c.max_queue_size, 65536);
        assert_eq!(c.queue_priority, QueuePriority::Default);
        assert!(!c.auto_limit_acct);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let c = PoolConfig::from_toml("max_servers = 64\nauto_limit_acct = true\n").unwrap();
        assert_eq!(c.max_servers, 64);
        assert!(c.auto_limit_acct);
        assert_eq!(c.start_servers, 5);
    }

    #[test]
    fn validate_rejects_queue_size_out_of_range() {
        let mut c = PoolConfig::default();
        c.max_queue_size = 1;
        assert!(c.validate().is_err());
        c.max_queue_size = 2_000_000;
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_spare_inversion() {
        let mut c = PoolConfig::default();
        c.min_spare_servers = 20;
        c.max_spare_servers = 10;
        assert!(c.validate().is_err());
    }
}
