//! Configuration management for unwalleted.
//!
//! Configuration is read from environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3001`.
//! - `CLIENT_URL` - Optional. Allowed CORS origin. Defaults to `http://localhost:3000`.
//! - `DEV_MODE` - Optional. Accepts any non-empty ID token as its own uid. Defaults to `false`.
//! - `JWT_SECRET` - Recommended. Secret for session tokens. A random one is generated when unset.
//! - `JWT_TTL_DAYS` - Optional. Session token lifetime. Defaults to `7`.
//! - `FIREBASE_PROJECT_ID` - Required unless `DEV_MODE=true`.
//! - `RATE_LIMIT_MAX` / `RATE_LIMIT_WINDOW_SECS` - Optional. Defaults to 100 requests per 900s.
//!   Both must be at least 1.
//! - `TRUST_PROXY` - Optional. Key rate limits on the first `X-Forwarded-For` hop instead of
//!   the peer address. Only enable behind a proxy that sets the header. Defaults to `false`.
//! - `FLOW_ACCESS_NODE` - Optional. Flow REST access node. Defaults to the testnet node.
//! - `FLOW_ADMIN_ADDRESS`, `FLOW_ADMIN_PRIVATE_KEY`, `FLOW_CONTRACT_ADDRESS` - Optional.
//!   When the contract address is set, rewards go through the Flow dispatcher. Addresses must
//!   be `0x` followed by 16 hex digits.
//! - `REWARD_MAX_ATTEMPTS` - Optional. Attempts per reward job. Defaults to `5`.
//! - `REWARD_QUEUE_CAPACITY` - Optional. Pending reward jobs. Defaults to `1024`.

use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::rewards::is_flow_address;

pub const DEFAULT_FLOW_ACCESS_NODE: &str = "https://rest-testnet.onflow.org";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Session token settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HMAC secret for session JWTs
    pub jwt_secret: String,

    /// Session token lifetime in days
    pub jwt_ttl_days: i64,

    /// Firebase project the ID tokens must be issued for
    pub firebase_project_id: Option<String>,
}

/// Per-client request limits.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window: Duration,
    /// Trust `X-Forwarded-For` for the client key
    pub trust_proxy: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(15 * 60),
            trust_proxy: false,
        }
    }
}

/// Flow network and reward worker settings.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// REST access node base URL
    pub access_node: String,

    pub admin_address: Option<String>,

    pub admin_private_key: Option<String>,

    /// Address the TaskRewardToken contract is deployed to
    pub contract_address: Option<String>,

    /// Attempts per reward job before it is dropped
    pub max_attempts: u32,

    /// Capacity of the reward job channel
    pub queue_capacity: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            access_node: DEFAULT_FLOW_ACCESS_NODE.to_string(),
            admin_address: None,
            admin_private_key: None,
            contract_address: None,
            max_attempts: 5,
            queue_capacity: 1024,
        }
    }
}

impl FlowConfig {
    /// Whether enough is configured to talk to the reward contract.
    pub fn is_enabled(&self) -> bool {
        self.contract_address.is_some()
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Frontend origin allowed by CORS
    pub client_url: String,

    /// Accept unverified identity tokens (local development only)
    pub dev_mode: bool,

    pub auth: AuthConfig,

    pub rate_limit: RateLimitConfig,

    pub flow: FlowConfig,
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        _ => Ok(default),
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("expected a boolean, got {:?}", other),
        )),
    }
}

fn validate_url(name: &str, value: &str) -> Result<(), ConfigError> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

fn at_least_one<T: PartialOrd + From<u8>>(name: &str, value: T) -> Result<T, ConfigError> {
    if value < T::from(1) {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be at least 1".to_string(),
        ));
    }
    Ok(value)
}

fn flow_address(name: &str, value: Option<String>) -> Result<Option<String>, ConfigError> {
    match value {
        Some(address) if !is_flow_address(&address) => Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("expected 0x followed by 16 hex digits, got {:?}", address),
        )),
        other => Ok(other),
    }
}

fn random_secret() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `FIREBASE_PROJECT_ID` is not set outside dev mode,
    /// and `ConfigError::InvalidValue` for values that fail to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env_opt("HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port: u16 = env_or("PORT", 3001)?;

        let client_url =
            env_opt("CLIENT_URL").unwrap_or_else(|| "http://localhost:3000".to_string());
        validate_url("CLIENT_URL", &client_url)?;

        let dev_mode = match std::env::var("DEV_MODE") {
            Ok(raw) => parse_bool("DEV_MODE", &raw)?,
            Err(_) => false,
        };

        let jwt_secret = match env_opt("JWT_SECRET") {
            Some(secret) => secret,
            None => {
                tracing::warn!(
                    "JWT_SECRET not set; generated an ephemeral secret, sessions will not survive a restart"
                );
                random_secret()
            }
        };
        let jwt_ttl_days: i64 = env_or("JWT_TTL_DAYS", 7)?;
        if jwt_ttl_days < 1 {
            return Err(ConfigError::InvalidValue(
                "JWT_TTL_DAYS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let firebase_project_id = env_opt("FIREBASE_PROJECT_ID");
        if firebase_project_id.is_none() && !dev_mode {
            return Err(ConfigError::MissingEnvVar("FIREBASE_PROJECT_ID".to_string()));
        }

        let trust_proxy = match std::env::var("TRUST_PROXY") {
            Ok(raw) => parse_bool("TRUST_PROXY", &raw)?,
            Err(_) => false,
        };
        let rate_limit = RateLimitConfig {
            max_requests: at_least_one("RATE_LIMIT_MAX", env_or("RATE_LIMIT_MAX", 100usize)?)?,
            window: Duration::from_secs(at_least_one(
                "RATE_LIMIT_WINDOW_SECS",
                env_or("RATE_LIMIT_WINDOW_SECS", 15 * 60u64)?,
            )?),
            trust_proxy,
        };

        let access_node =
            env_opt("FLOW_ACCESS_NODE").unwrap_or_else(|| DEFAULT_FLOW_ACCESS_NODE.to_string());
        validate_url("FLOW_ACCESS_NODE", &access_node)?;

        let flow = FlowConfig {
            access_node,
            admin_address: flow_address("FLOW_ADMIN_ADDRESS", env_opt("FLOW_ADMIN_ADDRESS"))?,
            admin_private_key: env_opt("FLOW_ADMIN_PRIVATE_KEY"),
            contract_address: flow_address(
                "FLOW_CONTRACT_ADDRESS",
                env_opt("FLOW_CONTRACT_ADDRESS"),
            )?,
            max_attempts: env_or("REWARD_MAX_ATTEMPTS", 5)?,
            queue_capacity: env_or("REWARD_QUEUE_CAPACITY", 1024)?,
        };

        Ok(Self {
            host,
            port,
            client_url,
            dev_mode,
            auth: AuthConfig {
                jwt_secret,
                jwt_ttl_days,
                firebase_project_id,
            },
            rate_limit,
            flow,
        })
    }

    /// Dev-mode config with a fixed secret (useful for testing).
    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            client_url: "http://localhost:3000".to_string(),
            dev_mode: true,
            auth: AuthConfig {
                jwt_secret: "test-secret".to_string(),
                jwt_ttl_days: 7,
                firebase_project_id: None,
            },
            rate_limit: RateLimitConfig::default(),
            flow: FlowConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_values() {
        assert!(parse_bool("DEV_MODE", "true").unwrap());
        assert!(parse_bool("DEV_MODE", " YES ").unwrap());
        assert!(!parse_bool("DEV_MODE", "0").unwrap());
        assert!(parse_bool("DEV_MODE", "maybe").is_err());
    }

    #[test]
    fn test_env_or_uses_default_when_unset() {
        let value: u16 = env_or("UNWALLETED_TEST_UNSET_PORT", 3001).unwrap();
        assert_eq!(value, 3001);
    }

    #[test]
    fn test_env_or_rejects_invalid_port() {
        std::env::set_var("UNWALLETED_TEST_BAD_PORT", "not-a-port");
        let result: Result<u16, _> = env_or("UNWALLETED_TEST_BAD_PORT", 3001);
        std::env::remove_var("UNWALLETED_TEST_BAD_PORT");
        match result {
            Err(ConfigError::InvalidValue(name, _)) => assert_eq!(name, "UNWALLETED_TEST_BAD_PORT"),
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_flow_disabled_without_contract() {
        let mut flow = FlowConfig::default();
        assert!(!flow.is_enabled());
        flow.contract_address = Some("0x01cf0e2f2f715450".to_string());
        assert!(flow.is_enabled());
    }

    #[test]
    fn test_rate_limit_values_must_be_positive() {
        assert!(matches!(
            at_least_one("RATE_LIMIT_MAX", 0usize),
            Err(ConfigError::InvalidValue(name, _)) if name == "RATE_LIMIT_MAX"
        ));
        assert!(at_least_one("RATE_LIMIT_WINDOW_SECS", 0u64).is_err());
        assert_eq!(at_least_one("RATE_LIMIT_MAX", 100usize).unwrap(), 100);
        assert_eq!(at_least_one("RATE_LIMIT_WINDOW_SECS", 1u64).unwrap(), 1);
    }

    #[test]
    fn test_flow_address_format_checked() {
        assert_eq!(
            flow_address("FLOW_CONTRACT_ADDRESS", Some("0x01cf0e2f2f715450".to_string())).unwrap(),
            Some("0x01cf0e2f2f715450".to_string())
        );
        assert_eq!(flow_address("FLOW_CONTRACT_ADDRESS", None).unwrap(), None);
        for bad in ["01cf0e2f2f715450", "0x01cf", "0x01cf0e2f2f71545z", "0x1 } import Evil"] {
            assert!(
                flow_address("FLOW_CONTRACT_ADDRESS", Some(bad.to_string())).is_err(),
                "{} accepted",
                bad
            );
        }
    }

    #[test]
    fn test_random_secret_is_hex() {
        let secret = random_secret();
        assert_eq!(secret.len(), 64);
        assert!(hex::decode(&secret).is_ok());
    }
}
