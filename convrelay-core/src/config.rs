use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub auth: AuthConfig,
    pub cors: CorsConfig,
    pub upstream: UpstreamConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

/// Redis backs both the ownership registry and the routing channel.
/// An empty `url` selects single-instance mode: ownership is kept in
/// process memory and routed events never leave the instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub connect_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// Path to the HS256 secret key file (mounted from secret storage)
    pub secret_key_path: String,
    /// Lifetime of issued session tokens, in minutes
    pub token_lifetime_minutes: i64,
    /// Project identifier stamped into and checked against token claims
    pub project_id: String,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret_key_path: "/secret/jwt_secret_key".to_string(),
            token_lifetime_minutes: 60,
            project_id: String::new(),
        }
    }
}

/// How `/register` callers prove themselves before a session token is issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthOption {
    /// Accept any caller (development / trusted-network deployments)
    Skip,
    /// Compare the Authorization header against `shared_secret`
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub option: AuthOption,
    pub shared_secret: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            option: AuthOption::Skip,
            shared_secret: None,
        }
    }
}

/// Origins allowed to reach the HTTP/WebSocket surface.
/// An empty list allows any origin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

/// Upstream conversational-AI API reached by the authenticated proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// API host; regional calls go to `<location>-<host>`
    pub host: String,
    pub scheme: String,
    /// Bearer token attached to forwarded calls, if any
    pub bearer_token: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "dialogflow.googleapis.com".to_string(),
            scheme: "https".to_string(),
            bearer_token: None,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (CONVRELAY_SERVER_HOST, etc.)
        builder = builder.add_source(
            Environment::with_prefix("CONVRELAY")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Validate configuration, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.jwt.secret_key_path.is_empty() {
            errors.push("jwt.secret_key_path must not be empty".to_string());
        }
        if self.jwt.token_lifetime_minutes <= 0 {
            errors.push("jwt.token_lifetime_minutes must be positive".to_string());
        }
        if self.auth.option == AuthOption::Static
            && self.auth.shared_secret.as_deref().unwrap_or("").is_empty()
        {
            errors.push("auth.shared_secret is required when auth.option is 'static'".to_string());
        }
        if self.upstream.host.is_empty() {
            errors.push("upstream.host must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get Redis URL
    #[must_use]
    pub fn redis_url(&self) -> &str {
        &self.redis.url
    }

    /// Whether this instance participates in cross-instance routing
    #[must_use]
    pub fn is_clustered(&self) -> bool {
        !self.redis.url.is_empty()
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(!config.redis_url().is_empty());
        assert!(config.is_clustered());
        assert!(config.server.http_port > 0);
        assert_eq!(config.auth.option, AuthOption::Skip);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_http_address() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                http_port: 8080,
            },
            ..Config::default()
        };

        assert_eq!(config.http_address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_static_auth_requires_secret() {
        let config = Config {
            auth: AuthConfig {
                option: AuthOption::Static,
                shared_secret: None,
            },
            ..Config::default()
        };

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("shared_secret")));
    }

    #[test]
    fn test_empty_redis_url_is_single_instance() {
        let config = Config {
            redis: RedisConfig {
                url: String::new(),
                connect_timeout_seconds: 5,
            },
            ..Config::default()
        };

        assert!(!config.is_clustered());
    }
}
