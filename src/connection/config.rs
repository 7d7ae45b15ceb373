use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the schema manager adds columns to an existing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlterStrategy {
    /// One `ALTER TABLE ADD COLUMN` per missing column.
    Soft,
    /// Recreate the table with the column superset inside one exclusive transaction.
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Leases stored in the shared database file, visible to every process.
    Database,
    /// In-process only.
    Local,
}

/// Store configuration
///
/// Built with chained setters or parsed from a `tdmdb://` URL.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite database file
    pub database_path: PathBuf,

    /// Maximum number of connections in pool
    pub max_connections: usize,

    /// Minimum number of connections in pool
    pub min_connections: usize,

    /// How long `get_connection` waits for a free connection
    pub connect_timeout: Duration,

    /// SQLite busy handler timeout
    pub busy_timeout: Duration,

    /// Connection idle timeout
    pub idle_timeout: Option<Duration>,

    /// Maximum connection lifetime
    pub max_lifetime: Option<Duration>,

    pub alter_strategy: AlterStrategy,

    pub lock_mode: LockMode,

    /// Lease length of a distributed lock; an expired lease may be taken over
    pub lock_ttl: Duration,

    pub lock_acquire_timeout: Duration,

    /// Number of tables remembered by the last-usage tracker
    pub usage_cache_capacity: usize,

    /// Rows per insert transaction
    pub insert_batch_size: usize,

    /// Source query timeout used when nothing else is recorded
    pub default_query_timeout: Duration,

    /// Start the cron scheduler and restore stored jobs on open
    pub scheduler_enabled: bool,
}

impl StoreConfig {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            max_connections: 8,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
            alter_strategy: AlterStrategy::Soft,
            lock_mode: LockMode::Database,
            lock_ttl: Duration::from_secs(300),
            lock_acquire_timeout: Duration::from_secs(60),
            usage_cache_capacity: 1000,
            insert_batch_size: 100,
            default_query_timeout: Duration::from_secs(60),
            scheduler_enabled: true,
        }
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    pub fn alter_strategy(mut self, strategy: AlterStrategy) -> Self {
        self.alter_strategy = strategy;
        self
    }

    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn lock_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquire_timeout = timeout;
        self
    }

    pub fn usage_cache_capacity(mut self, capacity: usize) -> Self {
        self.usage_cache_capacity = capacity;
        self
    }

    pub fn insert_batch_size(mut self, size: usize) -> Self {
        self.insert_batch_size = size;
        self
    }

    pub fn default_query_timeout(mut self, timeout: Duration) -> Self {
        self.default_query_timeout = timeout;
        self
    }

    pub fn scheduler_enabled(mut self, enabled: bool) -> Self {
        self.scheduler_enabled = enabled;
        self
    }

    /// Parse from connection string
    ///
    /// Format: `tdmdb:///path/to/store.db?max_connections=8&alter=hard&lock=local`
    ///
    /// # Examples
    ///
    /// ```
    /// # use tdmdb::StoreConfig;
    /// let config = StoreConfig::from_url("tdmdb:///tmp/store.db?alter=hard").unwrap();
    /// assert_eq!(config.database_path.to_str(), Some("/tmp/store.db"));
    /// ```
    pub fn from_url(url: &str) -> Result<Self, String> {
        let rest = url
            .strip_prefix("tdmdb://")
            .ok_or_else(|| "URL must start with 'tdmdb://'".to_string())?;

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        if path.is_empty() {
            return Err("URL must contain a database path".to_string());
        }

        let mut config = Self::new(path);

        for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("Invalid parameter '{}'", pair))?;
            config = config.apply_param(key, value)?;
        }

        Ok(config)
    }

    fn apply_param(self, key: &str, value: &str) -> Result<Self, String> {
        let number = |v: &str| -> Result<u64, String> {
            v.parse::<u64>()
                .map_err(|_| format!("Invalid value '{}' for '{}'", v, key))
        };

        Ok(match key {
            "max_connections" => self.max_connections(number(value)? as usize),
            "min_connections" => self.min_connections(number(value)? as usize),
            "connect_timeout_ms" => self.connect_timeout(Duration::from_millis(number(value)?)),
            "busy_timeout_ms" => self.busy_timeout(Duration::from_millis(number(value)?)),
            "lock_ttl_secs" => self.lock_ttl(Duration::from_secs(number(value)?)),
            "lock_timeout_secs" => self.lock_acquire_timeout(Duration::from_secs(number(value)?)),
            "usage_cache" => self.usage_cache_capacity(number(value)? as usize),
            "batch_size" => self.insert_batch_size(number(value)? as usize),
            "query_timeout_secs" => {
                self.default_query_timeout(Duration::from_secs(number(value)?))
            }
            "alter" => match value {
                "soft" => self.alter_strategy(AlterStrategy::Soft),
                "hard" => self.alter_strategy(AlterStrategy::Hard),
                other => return Err(format!("Unknown alter strategy '{}'", other)),
            },
            "lock" => match value {
                "database" => self.lock_mode(LockMode::Database),
                "local" => self.lock_mode(LockMode::Local),
                other => return Err(format!("Unknown lock mode '{}'", other)),
            },
            "scheduler" => match value {
                "on" | "true" => self.scheduler_enabled(true),
                "off" | "false" => self.scheduler_enabled(false),
                other => return Err(format!("Invalid scheduler flag '{}'", other)),
            },
            other => return Err(format!("Unknown parameter '{}'", other)),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.database_path.as_os_str().is_empty() {
            return Err("database_path cannot be empty".to_string());
        }

        if self.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }

        if self.min_connections > self.max_connections {
            return Err("min_connections cannot exceed max_connections".to_string());
        }

        if self.insert_batch_size == 0 {
            return Err("insert_batch_size must be > 0".to_string());
        }

        if self.usage_cache_capacity == 0 {
            return Err("usage_cache_capacity must be > 0".to_string());
        }

        Ok(())
    }
}
