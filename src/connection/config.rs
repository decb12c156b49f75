use std::path::PathBuf;
use std::time::Duration;

/// Where the SQLite database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    File(PathBuf),
    /// Named in-memory database shared by every connection of one pool.
    Memory(String),
}

/// Database connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub location: DatabaseLocation,

    /// How long SQLite waits on a locked database before reporting busy
    pub busy_timeout: Duration,

    /// How long `get_connection` waits for a free connection
    pub connect_timeout: Duration,

    /// Maximum number of connections in pool
    pub max_connections: usize,

    /// Minimum number of connections in pool
    pub min_connections: usize,

    /// Connection idle timeout
    pub idle_timeout: Option<Duration>,

    /// Maximum connection lifetime
    pub max_lifetime: Option<Duration>,

    /// Switch file databases to WAL journaling
    pub journal_wal: bool,
}

impl ConnectionConfig {
    /// Configuration for a database file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            location: DatabaseLocation::File(path.into()),
            busy_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            max_connections: 10,
            min_connections: 1,
            idle_timeout: Some(Duration::from_secs(600)), // 10 minutes
            max_lifetime: Some(Duration::from_secs(1800)), // 30 minutes
            journal_wal: true,
        }
    }

    /// Fresh in-memory database with a unique name.
    pub fn in_memory() -> Self {
        Self::named_memory(&format!("dynaschema_{}", uuid::Uuid::new_v4().simple()))
    }

    /// In-memory database shared by name.
    pub fn named_memory(name: &str) -> Self {
        Self {
            location: DatabaseLocation::Memory(name.to_string()),
            ..Self::new("")
        }
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
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

    pub fn journal_wal(mut self, enabled: bool) -> Self {
        self.journal_wal = enabled;
        self
    }

    /// Parse from connection string
    ///
    /// Accepts `sqlite://<path>`, `sqlite::memory:` and `sqlite::memory:<name>`.
    pub fn from_url(url: &str) -> Result<Self, String> {
        if let Some(rest) = url.strip_prefix("sqlite::memory:") {
            return Ok(if rest.is_empty() {
                Self::in_memory()
            } else {
                Self::named_memory(rest)
            });
        }

        let path = url
            .strip_prefix("sqlite://")
            .ok_or_else(|| "URL must start with 'sqlite://' or 'sqlite::memory:'".to_string())?;
        if path.is_empty() {
            return Err("Database path cannot be empty".to_string());
        }
        Ok(Self::new(path))
    }

    /// Convert to connection string
    pub fn to_url(&self) -> String {
        match &self.location {
            DatabaseLocation::File(path) => format!("sqlite://{}", path.display()),
            DatabaseLocation::Memory(name) => format!("sqlite::memory:{}", name),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        match &self.location {
            DatabaseLocation::File(path) if path.as_os_str().is_empty() => {
                return Err("Database path cannot be empty".to_string());
            }
            DatabaseLocation::Memory(name) if name.is_empty() => {
                return Err("In-memory database name cannot be empty".to_string());
            }
            _ => {}
        }

        if self.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }

        if self.min_connections > self.max_connections {
            return Err("min_connections cannot exceed max_connections".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = ConnectionConfig::new("/tmp/app.db")
            .max_connections(4)
            .min_connections(2)
            .busy_timeout(Duration::from_millis(250));

        assert_eq!(config.max_connections, 4);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_url() {
        let config = ConnectionConfig::from_url("sqlite:///var/lib/app.db").unwrap();
        assert_eq!(config.location, DatabaseLocation::File("/var/lib/app.db".into()));
        assert_eq!(config.to_url(), "sqlite:///var/lib/app.db");

        let config = ConnectionConfig::from_url("sqlite::memory:shared_test").unwrap();
        assert_eq!(config.location, DatabaseLocation::Memory("shared_test".into()));

        assert!(ConnectionConfig::from_url("postgres://localhost/db").is_err());
    }

    #[test]
    fn test_in_memory_names_are_unique() {
        let a = ConnectionConfig::in_memory();
        let b = ConnectionConfig::in_memory();
        assert_ne!(a.location, b.location);
    }

    #[test]
    fn test_validation() {
        let config = ConnectionConfig::in_memory().max_connections(0);
        assert!(config.validate().is_err());

        let config = ConnectionConfig::in_memory().min_connections(10).max_connections(5);
        assert!(config.validate().is_err());

        assert!(ConnectionConfig::new("").validate().is_err());
    }
}
