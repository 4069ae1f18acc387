use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address
    pub bind_addr: String,

    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,

    /// Number of worker threads
    pub threads: usize,

    /// Slots per shard, as a power of two
    pub slot_bits: u32,

    /// Capacity of the shard array
    pub max_shards: usize,

    /// Size of the connection arena, listener included
    pub max_connections: usize,

    /// Capacity of the global event ring
    pub event_queue_capacity: usize,

    /// Capacity of each per-connection event ring
    pub connection_queue_capacity: usize,

    /// Maximum number of events fetched by one kernel wait
    pub poll_batch: usize,

    /// Back-off while the global ring cannot take a whole batch
    pub enqueue_retry_ms: u64,

    /// TCP nodelay
    pub tcp_nodelay: bool,

    /// Pin worker threads to CPUs
    pub cpu_affinity: bool,

    /// Numeric trace level (-1 errors only, 0 default, 1 and 2 verbose)
    pub trace_level: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 22000,
            threads: 4,
            slot_bits: 20,
            max_shards: 1024,
            max_connections: 4096,
            event_queue_capacity: 1024,
            connection_queue_capacity: 64,
            poll_batch: 512,
            enqueue_retry_ms: 1,
            tcp_nodelay: true,
            cpu_affinity: false,
            trace_level: 0,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Example
    ///
    /// ```no_run
    /// use yari::Config;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = Config::from_file("yari.toml")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.threads == 0 {
            anyhow::bail!("threads must be > 0");
        }

        if !(1..=28).contains(&self.slot_bits) {
            anyhow::bail!("slot_bits must be within 1..=28");
        }

        if self.max_shards == 0 {
            anyhow::bail!("max_shards must be > 0");
        }

        if self.max_connections < 2 {
            anyhow::bail!("max_connections must be >= 2");
        }

        if self.event_queue_capacity < 2 || self.connection_queue_capacity < 2 {
            anyhow::bail!("event queue capacities must be >= 2");
        }

        // one ring slot always stays empty to tell full from empty
        if self.poll_batch == 0 || self.poll_batch >= self.event_queue_capacity {
            anyhow::bail!("poll_batch must be within 1..event_queue_capacity");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 22000);
        assert_eq!(config.threads, 4);
    }

    #[test]
    fn test_rejects_batch_larger_than_ring() {
        let config = Config {
            poll_batch: 1024,
            event_queue_capacity: 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("threads = 8\nport = 23000\n").unwrap();
        assert_eq!(config.threads, 8);
        assert_eq!(config.port, 23000);
        assert_eq!(config.slot_bits, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_round_trip() {
        let path = std::env::temp_dir().join(format!("yari-config-{}.toml", std::process::id()));
        let config = Config {
            port: 23456,
            threads: 2,
            slot_bits: 12,
            cpu_affinity: true,
            trace_level: -1,
            ..Default::default()
        };

        config.to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(loaded.port, 23456);
        assert_eq!(loaded.threads, 2);
        assert_eq!(loaded.slot_bits, 12);
        assert!(loaded.cpu_affinity);
        assert_eq!(loaded.trace_level, -1);
        assert_eq!(loaded.poll_batch, config.poll_batch);
        assert!(loaded.validate().is_ok());
    }
}
