//! Configuration loading from the environment

use std::env;

use crate::error::{Error, Result};

use super::{BusBackend, Config, CorsConfig, DatabaseConfig, LogConfig, PubSubConfig, ServerConfig};

/// Load configuration, seeding the environment from a dotenv file first.
///
/// `ENV_FILE` points at an alternate file; otherwise the default `.env` in
/// the working directory is used when present.
pub fn load() -> Result<Config> {
    match env::var("ENV_FILE") {
        Ok(path) if !path.is_empty() => {
            dotenvy::from_filename(&path)
                .map_err(|e| Error::Config(format!("Error loading env file {}: {}", path, e)))?;
        }
        _ => {
            // A missing default .env is fine; the environment may be complete.
            let _ = dotenvy::dotenv();
        }
    }
    from_env()
}

/// Build a configuration from the current process environment.
pub fn from_env() -> Result<Config> {
    let env_name = var_or("ENV", "development");

    let server = ServerConfig {
        host: var_or("SERVER_HOST", "0.0.0.0"),
        port: parse_port("SERVER_PORT", 8080)?,
    };

    let database = DatabaseConfig {
        host: var_or("DB_HOST", "localhost"),
        port: parse_port("DB_PORT", 5432)?,
        user: var_or("DB_USER", "postgres"),
        password: var_or("DB_PASSWORD", "postgres"),
        name: var_or("DB_NAME", "chat"),
        record_transient: parse_bool("DB_RECORD_TRANSIENT", false)?,
    };

    let pubsub = PubSubConfig {
        backend: parse_backend(&env_name)?,
        host: var_or("PUBSUB_SERVER_HOST", "localhost"),
        port: parse_port("PUBSUB_SERVER_PORT", 6379)?,
        password: var_or("PUBSUB_SERVER_PASS", ""),
    };

    let cors = CorsConfig {
        allowed_origins: parse_list(&var_or("ALLOWED_ORIGINS", "")),
    };

    let log = LogConfig {
        file: env::var("LOG_FILE").ok().filter(|v| !v.is_empty()),
        output: parse_list(&var_or("LOG_OUTPUT", "stdout")),
        file_level: var_or("LOG_FILE_LEVEL", "info"),
        console_level: var_or("LOG_CONSOLE_LEVEL", "info"),
    };

    Ok(Config {
        env: env_name,
        server,
        database,
        pubsub,
        cors,
        log,
    })
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_port(key: &str, default: u16) -> Result<u16> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value
            .parse()
            .map_err(|_| Error::Config(format!("Invalid {}: {}", key, value))),
        _ => Ok(default),
    }
}

fn parse_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(Error::Config(format!("Invalid {}: {}", key, other))),
        },
        _ => Ok(default),
    }
}

/// Bus backend: explicit `PUBSUB_BACKEND` wins, otherwise development runs
/// on the in-process bus and everything else expects Redis.
fn parse_backend(env_name: &str) -> Result<BusBackend> {
    match env::var("PUBSUB_BACKEND") {
        Ok(value) if !value.is_empty() => match value.to_ascii_lowercase().as_str() {
            "memory" => Ok(BusBackend::Memory),
            "redis" => Ok(BusBackend::Redis),
            other => Err(Error::Config(format!("Unknown PUBSUB_BACKEND: {}", other))),
        },
        _ if env_name == "development" => Ok(BusBackend::Memory),
        _ => Ok(BusBackend::Redis),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
