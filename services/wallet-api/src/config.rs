use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use wallet_core::WalletConfig;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    pub max_connections: u32,
    /// Use the in-process store instead of Postgres (local runs only)
    pub in_memory: bool,
    pub run_migrations: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthConfig {
    #[serde(default)]
    pub jwt_secret: String,
    pub admin_scope: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            // Start with default configuration
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.workers", 4)?
            .set_default("database.max_connections", 10)?
            .set_default("database.in_memory", false)?
            .set_default("database.run_migrations", true)?
            .set_default("auth.admin_scope", "wallet:admin")?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?;

        // Add environment-specific config file if it exists
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("WALLET_API")
                .separator("__")
                .list_separator(","),
        );

        // Special handling for common env vars
        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", db_url)?;
        }

        if let Ok(secret) = env::var("JWT_SECRET") {
            builder = builder.set_override("auth.jwt_secret", secret)?;
        }

        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.database.url.is_empty() && !self.database.in_memory {
            return Err("Database URL is required".to_string());
        }

        if self.auth.jwt_secret.len() < 32 {
            return Err("JWT secret must be at least 32 bytes".to_string());
        }

        if self.auth.admin_scope.is_empty() {
            return Err("Admin scope cannot be empty".to_string());
        }

        self.wallet.validate().map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 8080,
                workers: 1,
            },
            database: DatabaseConfig {
                url: String::new(),
                max_connections: 1,
                in_memory: true,
                run_migrations: false,
            },
            auth: AuthConfig {
                jwt_secret: "0123456789abcdef0123456789abcdef".into(),
                admin_scope: "wallet:admin".into(),
            },
            logging: LoggingConfig {
                level: "info".into(),
                json: false,
            },
            wallet: WalletConfig::default(),
        }
    }

    #[test]
    fn test_in_memory_needs_no_database_url() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_postgres_needs_database_url() {
        let mut config = config();
        config.database.in_memory = false;
        assert_eq!(config.validate().unwrap_err(), "Database URL is required");
    }

    #[test]
    fn test_short_jwt_secret_rejected() {
        let mut config = config();
        config.auth.jwt_secret = "short".into();
        assert!(config.validate().is_err());
    }
}
