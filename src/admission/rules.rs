//! Quota tiers and rule resolution.
//!
//! Maps a request to the ordered set of quota tiers that apply to it.
//! Tier order is fixed: Endpoint → Identity → Address. Passing an earlier
//! tier never exempts a request from later ones, and the address tier
//! applies to authenticated callers too.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::{RuleScope, TurnstileConfig};
use crate::identity::ClientIdentity;

/// An endpoint rule with its resolved window budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateRule {
    /// Exact `METHOD:path` or a prefix ending in `*`
    pub pattern: String,
    pub limit: u32,
    pub period: Duration,
    pub scope: RuleScope,
    /// Roles the rule applies to; empty means all callers
    pub applicable_roles: Vec<String>,
    pub description: String,
}

impl RateRule {
    /// Whether this rule matches a `METHOD:path` target for a caller with
    /// the given effective role.
    pub fn matches(&self, target: &str, role: &str) -> bool {
        if !pattern_matches(&self.pattern, target) {
            return false;
        }
        self.applicable_roles.is_empty() || self.applicable_roles.iter().any(|r| r == role)
    }
}

/// The per-role identity budget selected for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleLimit {
    /// The role whose budget applies (after fallback resolution)
    pub role: String,
    pub limit: u32,
    pub period: Duration,
}

/// The per-address budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressLimit {
    pub limit: u32,
    pub period: Duration,
}

/// One quota tier selected for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tier {
    Endpoint(RateRule),
    Identity(RoleLimit),
    Address(AddressLimit),
}

impl Tier {
    /// Short tag used in window keys, logs, and rejection payloads.
    pub fn tag(&self) -> &'static str {
        match self {
            Tier::Endpoint(_) => "endpoint",
            Tier::Identity(_) => "identity",
            Tier::Address(_) => "address",
        }
    }

    /// The window budget this tier enforces.
    pub fn budget(&self) -> (u32, Duration) {
        match self {
            Tier::Endpoint(rule) => (rule.limit, rule.period),
            Tier::Identity(limit) => (limit.limit, limit.period),
            Tier::Address(limit) => (limit.limit, limit.period),
        }
    }
}

/// Match an exact `METHOD:path` pattern, or a trailing-`*` prefix pattern.
pub fn pattern_matches(pattern: &str, target: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => target.starts_with(prefix),
        None => pattern == target,
    }
}

/// Resolves the ordered tiers applicable to a request.
///
/// Built once from validated configuration; all state is immutable.
pub struct RuleResolver {
    endpoint_enabled: bool,
    endpoint_rules: Vec<RateRule>,
    identity_enabled: bool,
    role_limits: HashMap<String, RoleLimit>,
    fallback_limit: RoleLimit,
    address_enabled: bool,
    address_limit: AddressLimit,
    whitelist: Vec<String>,
}

impl RuleResolver {
    pub fn new(config: &TurnstileConfig) -> Self {
        let minute = Duration::from_secs(60);
        let flags = &config.feature_flags;

        let endpoint_rules = config
            .endpoint
            .rules
            .iter()
            .map(|rule| RateRule {
                pattern: rule.pattern.clone(),
                limit: rule.requests_per_minute,
                period: Duration::from_secs(rule.period_minutes * 60),
                scope: rule.scope,
                applicable_roles: rule.applicable_roles.clone(),
                description: rule.description.clone(),
            })
            .collect();

        let role_limits = config
            .identity
            .role_limits
            .iter()
            .map(|(role, limit)| {
                (
                    role.clone(),
                    RoleLimit {
                        role: role.clone(),
                        limit: limit.requests_per_minute,
                        period: minute,
                    },
                )
            })
            .collect();

        Self {
            endpoint_enabled: config.endpoint.enabled && flags.enable_endpoint_limiting,
            endpoint_rules,
            identity_enabled: config.identity.enabled && flags.enable_identity_limiting,
            role_limits,
            fallback_limit: RoleLimit {
                role: "default".to_string(),
                limit: config.global.default_limit,
                period: Duration::from_secs(config.global.period_minutes * 60),
            },
            address_enabled: config.address.enabled && flags.enable_address_limiting,
            address_limit: AddressLimit {
                limit: config.address.requests_per_minute,
                period: minute,
            },
            whitelist: config.address.whitelist.clone(),
        }
    }

    /// Select the tiers applicable to a request, in evaluation order.
    pub fn resolve(&self, method: &str, path: &str, identity: &ClientIdentity) -> Vec<Tier> {
        let mut tiers = Vec::new();
        let target = format!("{}:{}", method, path);

        if self.endpoint_enabled {
            for rule in &self.endpoint_rules {
                if rule.matches(&target, &identity.role) {
                    tiers.push(Tier::Endpoint(rule.clone()));
                }
            }
        }

        if self.identity_enabled {
            tiers.push(Tier::Identity(self.role_limit_for(identity)));
        }

        if self.address_enabled && !self.is_whitelisted(identity) {
            tiers.push(Tier::Address(self.address_limit.clone()));
        }

        tiers
    }

    /// Role budget lookup: the caller's role, then "User" for authenticated
    /// callers with an unconfigured role, then the global fallback.
    fn role_limit_for(&self, identity: &ClientIdentity) -> RoleLimit {
        if let Some(limit) = self.role_limits.get(&identity.role) {
            return limit.clone();
        }
        if identity.authenticated {
            if let Some(limit) = self.role_limits.get("User") {
                return limit.clone();
            }
        }
        self.fallback_limit.clone()
    }

    /// Whitelist comparison uses the uncoarsened address.
    fn is_whitelisted(&self, identity: &ClientIdentity) -> bool {
        match &identity.raw_address {
            Some(addr) => self.whitelist.iter().any(|w| w == addr),
            None => false,
        }
    }
}
