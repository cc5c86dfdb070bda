//! Configuration management for Turnstile.
//!
//! All limits are loaded once at startup, validated, and shared immutably
//! (`Arc<TurnstileConfig>`) with every component. There is no runtime
//! mutation; changing limits requires a restart.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use crate::error::{Result, TurnstileError};

/// Main configuration for the Turnstile admission controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration (binary only)
    #[serde(default)]
    pub server: ServerConfig,

    /// Global admission-control switches and fallback limit
    #[serde(default)]
    pub global: GlobalConfig,

    /// Address-tier configuration
    #[serde(default)]
    pub address: AddressConfig,

    /// Identity-tier (per-role) configuration
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Endpoint-tier rule configuration
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Independent feature switches
    #[serde(default)]
    pub feature_flags: FeatureFlags,

    /// Deployment environment; rejection bodies carry diagnostic details
    /// only outside production.
    #[serde(default)]
    pub environment: Environment,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Production
    }
}

/// Global admission-control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Kill-switch: when false, every request is admitted with no side
    /// effects and no quota headers.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Fallback request budget when no role limit applies
    #[serde(default = "default_global_limit")]
    pub default_limit: u32,

    /// Window length for the fallback budget, in minutes
    #[serde(default = "default_period_minutes")]
    pub period_minutes: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_limit: default_global_limit(),
            period_minutes: default_period_minutes(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_global_limit() -> u32 {
    100
}

fn default_period_minutes() -> u64 {
    1
}

/// Address-tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Requests allowed per coarsened address per minute
    #[serde(default = "default_address_limit")]
    pub requests_per_minute: u32,

    /// Addresses exempt from the address tier (still subject to the
    /// endpoint and identity tiers)
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Proxy-forwarded headers consulted in order for the client address
    #[serde(default = "default_forward_headers")]
    pub trusted_forward_headers: Vec<String>,

    /// Whether forwarded headers are consulted at all
    #[serde(default = "default_true")]
    pub use_forward_headers: bool,
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: default_address_limit(),
            whitelist: Vec::new(),
            trusted_forward_headers: default_forward_headers(),
            use_forward_headers: true,
        }
    }
}

fn default_address_limit() -> u32 {
    60
}

fn default_forward_headers() -> Vec<String> {
    vec!["x-forwarded-for".to_string(), "x-real-ip".to_string()]
}

/// Identity-tier configuration: a request budget per role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Role name to limit; must contain at least "Anonymous" and "User"
    #[serde(default = "default_role_limits")]
    pub role_limits: HashMap<String, RoleLimitConfig>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            role_limits: default_role_limits(),
        }
    }
}

/// Request budget for a single role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleLimitConfig {
    pub requests_per_minute: u32,
}

fn default_role_limits() -> HashMap<String, RoleLimitConfig> {
    let mut limits = HashMap::new();
    limits.insert(
        "Anonymous".to_string(),
        RoleLimitConfig {
            requests_per_minute: 30,
        },
    );
    limits.insert(
        "User".to_string(),
        RoleLimitConfig {
            requests_per_minute: 120,
        },
    );
    limits
}

/// Endpoint-tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Endpoint rules, evaluated in declaration order
    #[serde(default)]
    pub rules: Vec<EndpointRuleConfig>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
        }
    }
}

/// A single endpoint rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRuleConfig {
    /// Exact `METHOD:path` or a prefix ending in `*`
    pub pattern: String,

    pub requests_per_minute: u32,

    /// Window length in minutes
    #[serde(default = "default_period_minutes")]
    pub period_minutes: u64,

    /// Whether the budget is shared by all callers or tracked per identity
    #[serde(default)]
    pub scope: RuleScope,

    /// Roles the rule applies to; empty means all callers
    #[serde(default)]
    pub applicable_roles: Vec<String>,

    #[serde(default)]
    pub description: String,
}

/// Scope of an endpoint rule's budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// One shared window across all callers
    Global,
    /// One window per client identity
    PerIdentity,
}

impl Default for RuleScope {
    fn default() -> Self {
        RuleScope::Global
    }
}

/// Independent feature switches for the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default = "default_true")]
    pub enable_address_limiting: bool,
    #[serde(default = "default_true")]
    pub enable_identity_limiting: bool,
    #[serde(default = "default_true")]
    pub enable_endpoint_limiting: bool,
    #[serde(default)]
    pub enable_audit_logging: bool,
    #[serde(default)]
    pub enable_perf_monitoring: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_address_limiting: true,
            enable_identity_limiting: true,
            enable_endpoint_limiting: true,
            enable_audit_logging: false,
            enable_perf_monitoring: false,
        }
    }
}

impl TurnstileConfig {
    /// Load configuration from a YAML file and validate it.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string and validate it.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate limits and patterns. Called at load so configuration
    /// mistakes surface at boot, never at request time.
    pub fn validate(&self) -> Result<()> {
        if self.global.default_limit == 0 {
            return Err(TurnstileError::Config(
                "global.default_limit must be greater than zero".to_string(),
            ));
        }
        if self.global.period_minutes == 0 {
            return Err(TurnstileError::Config(
                "global.period_minutes must be greater than zero".to_string(),
            ));
        }
        if self.address.requests_per_minute == 0 {
            return Err(TurnstileError::Config(
                "address.requests_per_minute must be greater than zero".to_string(),
            ));
        }
        for addr in &self.address.whitelist {
            if addr.parse::<IpAddr>().is_err() {
                return Err(TurnstileError::Config(format!(
                    "address.whitelist entry is not a valid IP address: {}",
                    addr
                )));
            }
        }
        for required in ["Anonymous", "User"] {
            if !self.identity.role_limits.contains_key(required) {
                return Err(TurnstileError::Config(format!(
                    "identity.role_limits must contain a \"{}\" entry",
                    required
                )));
            }
        }
        for (role, limit) in &self.identity.role_limits {
            if limit.requests_per_minute == 0 {
                return Err(TurnstileError::Config(format!(
                    "identity.role_limits[{}].requests_per_minute must be greater than zero",
                    role
                )));
            }
        }
        for rule in &self.endpoint.rules {
            if rule.requests_per_minute == 0 || rule.period_minutes == 0 {
                return Err(TurnstileError::Config(format!(
                    "endpoint rule {:?} must have a non-zero limit and period",
                    rule.pattern
                )));
            }
            validate_pattern(&rule.pattern)?;
        }
        Ok(())
    }
}

/// A pattern is either an exact `METHOD:path` or a prefix ending in `*`.
fn validate_pattern(pattern: &str) -> Result<()> {
    if !pattern.contains(':') {
        return Err(TurnstileError::Config(format!(
            "endpoint pattern {:?} must be of the form METHOD:path",
            pattern
        )));
    }
    if let Some(star) = pattern.find('*') {
        if star != pattern.len() - 1 {
            return Err(TurnstileError::Config(format!(
                "endpoint pattern {:?} may only use '*' as a trailing wildcard",
                pattern
            )));
        }
    }
    Ok(())
}
