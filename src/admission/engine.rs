//! Tier evaluation and the admission decision.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::config::{RuleScope, TurnstileConfig};
use crate::identity::{ClientIdentity, UNKNOWN_IDENTITY};

use super::rules::{RuleResolver, Tier};
use super::store::{AdmissionResult, WindowStore};

/// The controller's verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Controller disabled, no tiers applied, or an internal fault made
    /// the request fail open. No quota headers are written.
    Bypassed,
    /// All selected tiers admitted; carries aggregated quota metadata.
    Admitted(AdmissionResult),
    /// A tier denied; carries that tier's result.
    Denied(AdmissionResult),
}

/// Evaluates quota tiers in precedence order and produces one decision.
pub struct AdmissionEngine<S> {
    config: Arc<TurnstileConfig>,
    resolver: RuleResolver,
    store: Arc<S>,
}

impl<S: WindowStore> AdmissionEngine<S> {
    pub fn new(config: Arc<TurnstileConfig>, store: Arc<S>) -> Self {
        let resolver = RuleResolver::new(&config);
        Self {
            config,
            resolver,
            store,
        }
    }

    /// Evaluate every applicable tier for a request, short-circuiting on
    /// the first denial. Tiers are cumulative: passing one never exempts
    /// the request from the rest.
    ///
    /// Internal store faults never escape: the request fails open and the
    /// fault is logged with a correlation id.
    pub async fn evaluate(
        &self,
        method: &str,
        path: &str,
        identity: &ClientIdentity,
        now: DateTime<Utc>,
    ) -> Decision {
        if !self.config.global.enabled {
            return Decision::Bypassed;
        }

        let started = Instant::now();
        let tiers = self.resolver.resolve(method, path, identity);
        if tiers.is_empty() {
            return Decision::Bypassed;
        }

        let mut passed: Vec<AdmissionResult> = Vec::with_capacity(tiers.len());
        for tier in &tiers {
            let key = self.window_key(tier, identity);
            let (limit, period) = tier.budget();
            trace!(key = %key, limit = limit, "Checking tier window");

            match self.store.check_and_record(&key, limit, period, now).await {
                Ok(result) if !result.allowed => {
                    let mut result = result;
                    result.violated_tier = Some(tier.tag().to_string());
                    self.audit_denial(method, path, identity, tier);
                    self.record_latency(started, tiers.len());
                    return Decision::Denied(result);
                }
                Ok(result) => passed.push(result),
                Err(e) => {
                    // Fail open: admission control must not take the API
                    // down with it.
                    let correlation_id = Uuid::new_v4();
                    error!(
                        correlation_id = %correlation_id,
                        tier = tier.tag(),
                        error = %e,
                        "Window store fault, admitting request"
                    );
                    return Decision::Bypassed;
                }
            }
        }

        self.record_latency(started, tiers.len());
        Decision::Admitted(aggregate(passed))
    }

    /// Composite window key: `tier-tag:identityOrAddress[:endpoint]`.
    /// Global-scoped endpoint rules share one window across all callers.
    fn window_key(&self, tier: &Tier, identity: &ClientIdentity) -> String {
        match tier {
            Tier::Endpoint(rule) => match rule.scope {
                RuleScope::Global => format!("endpoint:{}", rule.pattern),
                RuleScope::PerIdentity => {
                    format!("endpoint:{}:{}", identity.key, rule.pattern)
                }
            },
            Tier::Identity(_) => format!("identity:{}", identity.key),
            Tier::Address(_) => format!(
                "address:{}",
                identity.address.as_deref().unwrap_or(UNKNOWN_IDENTITY)
            ),
        }
    }

    /// Denials are expected traffic, not errors; they surface as audit
    /// events when audit logging is on.
    fn audit_denial(&self, method: &str, path: &str, identity: &ClientIdentity, tier: &Tier) {
        if self.config.feature_flags.enable_audit_logging {
            info!(
                target: "audit",
                identity = %identity.key,
                role = %identity.role,
                tier = tier.tag(),
                method = method,
                path = path,
                "Request denied by admission control"
            );
        }
    }

    fn record_latency(&self, started: Instant, tier_count: usize) {
        if self.config.feature_flags.enable_perf_monitoring {
            debug!(
                elapsed_us = started.elapsed().as_micros() as u64,
                tiers = tier_count,
                "Admission evaluation finished"
            );
        }
    }
}

/// Aggregate the results of all passed tiers into the quota metadata the
/// client sees: the tightest remaining count (with its limit) and the
/// furthest reset time, so headers are truthful across tiers rather than
/// reflecting only the last one checked.
fn aggregate(passed: Vec<AdmissionResult>) -> AdmissionResult {
    let reset_at = passed
        .iter()
        .map(|r| r.reset_at)
        .max()
        .expect("at least one tier passed");
    let tightest = passed
        .into_iter()
        .min_by_key(|r| r.remaining)
        .expect("at least one tier passed");

    AdmissionResult {
        reset_at,
        ..tightest
    }
}
