//! Configuration schema definitions

/// Main configuration structure
#[derive(Debug, Clone)]
pub struct Config {
    /// Deployment environment. `development` enables the plaintext listener
    /// and the loopback debug endpoint; anything else enforces TLS.
    pub env: String,

    pub server: ServerConfig,

    pub database: DatabaseConfig,

    pub pubsub: PubSubConfig,

    pub cors: CorsConfig,

    pub log: LogConfig,
}

impl Config {
    pub fn is_development(&self) -> bool {
        self.env == "development"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env: default_env(),
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            pubsub: PubSubConfig::default(),
            cors: CorsConfig::default(),
            log: LogConfig::default(),
        }
    }
}

fn default_env() -> String {
    "development".to_string()
}

/// HTTP/WebSocket listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Relational store configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,

    /// Durably record anonymous identities in the `transient` table.
    pub record_transient: bool,
}

impl DatabaseConfig {
    /// Connection string in the form tokio-postgres expects.
    pub fn conn_string(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, self.user, self.password, self.name
        )
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            name: "chat".to_string(),
            record_transient: false,
        }
    }
}

/// Which pub/sub transport backs the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusBackend {
    /// In-process fan-out; single node only. Default in development.
    Memory,
    /// Redis pub/sub; required for a multi-node fleet.
    Redis,
}

/// Pub/sub bus configuration
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub backend: BusBackend,
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl PubSubConfig {
    pub fn redis_url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/", self.host, self.port)
        } else {
            format!("redis://:{}@{}:{}/", self.password, self.host, self.port)
        }
    }
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Memory,
            host: "localhost".to_string(),
            port: 6379,
            password: String::new(),
        }
    }
}

/// Cross-origin policy for the HTTP surface
#[derive(Debug, Clone, Default)]
pub struct CorsConfig {
    /// Origins allowed to call the API. Empty or `*` means permissive.
    pub allowed_origins: Vec<String>,
}

impl CorsConfig {
    pub fn is_permissive(&self) -> bool {
        self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == "*")
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub file: Option<String>,
    /// Comma list of `stdout`, `file`.
    pub output: Vec<String>,
    pub file_level: String,
    pub console_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: None,
            output: vec!["stdout".to_string()],
            file_level: "info".to_string(),
            console_level: "info".to_string(),
        }
    }
}
