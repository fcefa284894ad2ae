//! Policy engine
//!
//! A pure rule table mapping an action context to a decision. Rules carry a
//! priority; every matching rule is collected and the lowest number wins.
//! IP parsing and CIDR containment go through the standard library and
//! `ipnet`; never regex.

use crate::core::types::Severity;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Deny,
    RequireApproval,
    DryRunOnly,
}

/// Context the engine evaluates one action against.
#[derive(Clone, Debug)]
pub struct ActionContext<'a> {
    pub kind: &'a str,
    pub parameter: &'a str,
    pub environment: &'a str,
    pub risk_level: Severity,
}

/// Outcome plus the rule that decided it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub decision: PolicyDecision,
    pub rule: &'static str,
    pub priority: u32,
}

const DESTRUCTIVE_KINDS: &[&str] = &[
    "block_ip",
    "suspend_user",
    "isolate_agent",
    "terminate_session",
];

/// Reserved-but-not-private addresses that must never be blocked:
/// loopback, unspecified, multicast, link-local, broadcast.
fn is_reserved(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_unspecified()
                || v4.is_multicast()
                || v4.is_link_local()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || v6.is_multicast(),
    }
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        // fc00::/7 unique-local
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Pure policy evaluator with an operator-managed IP whitelist.
pub struct PolicyEngine {
    whitelist: Vec<IpNet>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        PolicyEngine { whitelist: Vec::new() }
    }

    pub fn with_whitelist(whitelist: Vec<IpNet>) -> Self {
        info!("[Policy] whitelist carries {} networks", whitelist.len());
        PolicyEngine { whitelist }
    }

    pub fn add_whitelisted_network(&mut self, net: IpNet) {
        self.whitelist.push(net);
    }

    fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.whitelist.iter().any(|net| net.contains(ip))
    }

    /// Evaluate one action context. Lowest matching priority wins.
    pub fn evaluate(&self, ctx: &ActionContext<'_>) -> PolicyOutcome {
        let target_ip: Option<IpAddr> = ctx.parameter.parse().ok();
        let mut matched: Vec<PolicyOutcome> = Vec::new();

        if let Some(ip) = &target_ip {
            if self.is_whitelisted(ip) {
                matched.push(PolicyOutcome {
                    decision: PolicyDecision::Deny,
                    rule: "whitelisted_target",
                    priority: 5,
                });
            }
            if is_reserved(ip) {
                matched.push(PolicyOutcome {
                    decision: PolicyDecision::Deny,
                    rule: "reserved_target",
                    priority: 10,
                });
            }
            if is_private(ip) {
                matched.push(PolicyOutcome {
                    decision: PolicyDecision::RequireApproval,
                    rule: "private_target",
                    priority: 20,
                });
            }
        }

        if DESTRUCTIVE_KINDS.contains(&ctx.kind) {
            matched.push(PolicyOutcome {
                decision: PolicyDecision::RequireApproval,
                rule: "destructive_action",
                priority: 25,
            });
        }

        if ctx.environment == "production" {
            matched.push(PolicyOutcome {
                decision: PolicyDecision::RequireApproval,
                rule: "production_environment",
                priority: 30,
            });
        }

        matched.into_iter().min_by_key(|o| o.priority).unwrap_or(PolicyOutcome {
            decision: PolicyDecision::DryRunOnly,
            rule: "default",
            priority: 1000,
        })
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(kind: &'a str, parameter: &'a str, environment: &'a str) -> ActionContext<'a> {
        ActionContext {
            kind,
            parameter,
            environment,
            risk_level: Severity::High,
        }
    }

    #[test]
    fn loopback_is_never_blocked() {
        let engine = PolicyEngine::new();
        let outcome = engine.evaluate(&ctx("block_ip", "127.0.0.1", "development"));
        assert_eq!(outcome.decision, PolicyDecision::Deny);
        assert_eq!(outcome.rule, "reserved_target");

        let v6 = engine.evaluate(&ctx("block_ip", "::1", "development"));
        assert_eq!(v6.decision, PolicyDecision::Deny);
    }

    #[test]
    fn whitelist_outranks_everything() {
        let engine =
            PolicyEngine::with_whitelist(vec!["10.0.0.0/8".parse().unwrap()]);
        // 10.x is both whitelisted (5) and private (20): 5 wins
        let outcome = engine.evaluate(&ctx("block_ip", "10.1.2.3", "production"));
        assert_eq!(outcome.decision, PolicyDecision::Deny);
        assert_eq!(outcome.rule, "whitelisted_target");
    }

    #[test]
    fn private_ip_requires_approval() {
        let engine = PolicyEngine::new();
        let outcome = engine.evaluate(&ctx("rate_limit_ip", "192.168.1.50", "development"));
        assert_eq!(outcome.decision, PolicyDecision::RequireApproval);
        assert_eq!(outcome.rule, "private_target");
    }

    #[test]
    fn destructive_action_requires_approval() {
        let engine = PolicyEngine::new();
        let outcome = engine.evaluate(&ctx("suspend_user", "u-99", "development"));
        assert_eq!(outcome.decision, PolicyDecision::RequireApproval);
        assert_eq!(outcome.rule, "destructive_action");
    }

    #[test]
    fn production_requires_approval_for_public_targets() {
        let engine = PolicyEngine::new();
        let outcome = engine.evaluate(&ctx("block_ip", "203.0.113.10", "production"));
        // destructive (25) outranks production (30); same decision either way
        assert_eq!(outcome.decision, PolicyDecision::RequireApproval);
        assert_eq!(outcome.priority, 25);
    }

    #[test]
    fn default_is_dry_run_only() {
        let engine = PolicyEngine::new();
        let outcome = engine.evaluate(&ctx("flag_user", "u-1", "development"));
        assert_eq!(outcome.decision, PolicyDecision::DryRunOnly);
        assert_eq!(outcome.rule, "default");
    }

    #[test]
    fn public_ip_block_outside_production_still_gated() {
        let engine = PolicyEngine::new();
        let outcome = engine.evaluate(&ctx("block_ip", "198.51.100.7", "lab"));
        assert_eq!(outcome.decision, PolicyDecision::RequireApproval);
    }
}
