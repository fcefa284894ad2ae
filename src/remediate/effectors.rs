//! Effectors and runtime remediation state
//!
//! `RemediationState` is the single owned store of blocks, suspensions,
//! terminated sessions and rate limits, behind one reader-writer lock.
//! Mutations are mirrored to agent memory inside the same critical section
//! so the persistent view never drifts from the live one.

use crate::core::error::{SocError, SocResult};
use crate::core::types::now_secs;
use crate::memory::AgentMemory;
use crate::remediate::actions::Action;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Classic token bucket: `limit` tokens refilled evenly over `window_secs`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenBucket {
    pub limit: u32,
    pub window_secs: u64,
    tokens: f64,
    last_refill: i64,
}

impl TokenBucket {
    pub fn new(limit: u32, window_secs: u64) -> Self {
        TokenBucket {
            limit,
            window_secs: window_secs.max(1),
            tokens: limit as f64,
            last_refill: now_secs(),
        }
    }

    fn refill(&mut self, now: i64) {
        let elapsed = (now - self.last_refill).max(0) as f64;
        let rate = self.limit as f64 / self.window_secs as f64;
        self.tokens = (self.tokens + elapsed * rate).min(self.limit as f64);
        self.last_refill = now;
    }

    /// Consume one token; denied when none are available.
    pub fn try_consume(&mut self, now: i64) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn remaining(&self) -> u32 {
        self.tokens.floor().max(0.0) as u32
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockRecord {
    pub reason: String,
    pub alert_id: String,
    pub blocked_at: i64,
    pub duration_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuspensionRecord {
    pub reason: String,
    pub suspended_at: i64,
}

#[derive(Default)]
struct StateInner {
    blocked_ips: HashMap<String, BlockRecord>,
    suspended_users: HashMap<String, SuspensionRecord>,
    terminated_sessions: HashSet<String>,
    flagged_users: HashSet<String>,
    isolated_agents: HashSet<String>,
    /// target id -> monitoring-until timestamp
    enhanced_monitoring: HashMap<String, i64>,
    /// (entity_type, entity_id) -> bucket
    rate_limits: HashMap<(String, String), TokenBucket>,
    forensics_snapshots: Vec<String>,
    notifications: Vec<String>,
    review_queue: Vec<String>,
}

/// Owned runtime state of all effectors, mirrored to persistent memory.
pub struct RemediationState {
    inner: RwLock<StateInner>,
    memory: Arc<AgentMemory>,
}

impl RemediationState {
    pub fn new(memory: Arc<AgentMemory>) -> Self {
        RemediationState {
            inner: RwLock::new(StateInner::default()),
            memory,
        }
    }

    // -- blocks ---------------------------------------------------------

    pub fn block_ip(
        &self,
        ip: &str,
        reason: &str,
        alert_id: &str,
        duration_secs: u64,
    ) -> SocResult<()> {
        let record = BlockRecord {
            reason: reason.to_string(),
            alert_id: alert_id.to_string(),
            blocked_at: now_secs(),
            duration_secs,
        };
        let mut inner = self.inner.write();
        self.memory
            .upsert_block(ip, reason, alert_id, record.blocked_at, duration_secs)?;
        inner.blocked_ips.insert(ip.to_string(), record);
        info!("[State] 🚫 blocked ip {} for {}s ({})", ip, duration_secs, reason);
        Ok(())
    }

    pub fn unblock_ip(&self, ip: &str) -> SocResult<bool> {
        let mut inner = self.inner.write();
        self.memory.remove_block(ip)?;
        Ok(inner.blocked_ips.remove(ip).is_some())
    }

    pub fn is_ip_blocked(&self, ip: &str) -> bool {
        let inner = self.inner.read();
        inner
            .blocked_ips
            .get(ip)
            .map(|r| now_secs() - r.blocked_at < r.duration_secs as i64)
            .unwrap_or(false)
    }

    pub fn blocked_ip_count(&self) -> usize {
        self.inner.read().blocked_ips.len()
    }

    // -- users / sessions / agents -------------------------------------

    pub fn suspend_user(&self, user_id: &str, reason: &str) -> SocResult<()> {
        let mut inner = self.inner.write();
        self.memory.mark_user(user_id, false, true)?;
        inner.suspended_users.insert(
            user_id.to_string(),
            SuspensionRecord {
                reason: reason.to_string(),
                suspended_at: now_secs(),
            },
        );
        warn!("[State] suspended user {}", user_id);
        Ok(())
    }

    pub fn is_user_suspended(&self, user_id: &str) -> bool {
        self.inner.read().suspended_users.contains_key(user_id)
    }

    pub fn flag_user(&self, user_id: &str) -> SocResult<()> {
        let mut inner = self.inner.write();
        self.memory.mark_user(user_id, true, false)?;
        inner.flagged_users.insert(user_id.to_string());
        Ok(())
    }

    pub fn is_user_flagged(&self, user_id: &str) -> bool {
        self.inner.read().flagged_users.contains(user_id)
    }

    pub fn terminate_session(&self, session_id: &str) -> SocResult<()> {
        let mut inner = self.inner.write();
        self.memory.mark_session_terminated(session_id)?;
        inner.terminated_sessions.insert(session_id.to_string());
        warn!("[State] terminated session {}", session_id);
        Ok(())
    }

    pub fn is_session_terminated(&self, session_id: &str) -> bool {
        self.inner.read().terminated_sessions.contains(session_id)
    }

    pub fn isolate_agent(&self, agent_id: &str) -> SocResult<()> {
        let mut inner = self.inner.write();
        inner.isolated_agents.insert(agent_id.to_string());
        warn!("[State] ⛔ isolated agent {}", agent_id);
        Ok(())
    }

    pub fn is_agent_isolated(&self, agent_id: &str) -> bool {
        self.inner.read().isolated_agents.contains(agent_id)
    }

    // -- monitoring / notifications ------------------------------------

    pub fn enable_monitoring(&self, target: &str, hours: u64) {
        let until = now_secs() + (hours * 3600) as i64;
        self.inner
            .write()
            .enhanced_monitoring
            .insert(target.to_string(), until);
        info!("[State] enhanced monitoring on {} for {}h", target, hours);
    }

    pub fn is_monitored(&self, target: &str) -> bool {
        self.inner
            .read()
            .enhanced_monitoring
            .get(target)
            .map(|until| *until > now_secs())
            .unwrap_or(false)
    }

    pub fn record_forensics(&self, session_id: &str) {
        self.inner
            .write()
            .forensics_snapshots
            .push(session_id.to_string());
    }

    pub fn record_notification(&self, message: &str) {
        self.inner.write().notifications.push(message.to_string());
    }

    pub fn queue_for_review(&self, target: &str) {
        self.inner.write().review_queue.push(target.to_string());
    }

    pub fn review_queue_len(&self) -> usize {
        self.inner.read().review_queue.len()
    }

    // -- rate limits ----------------------------------------------------

    /// Install (or refresh) a token bucket for an entity.
    pub fn apply_rate_limit(
        &self,
        entity_type: &str,
        entity_id: &str,
        limit: u32,
        window_secs: u64,
    ) -> SocResult<()> {
        let bucket = TokenBucket::new(limit, window_secs);
        let mut inner = self.inner.write();
        self.memory.upsert_rate_limit(
            entity_type,
            entity_id,
            limit,
            window_secs,
            bucket.tokens,
            now_secs() + window_secs as i64,
        )?;
        inner
            .rate_limits
            .insert((entity_type.to_string(), entity_id.to_string()), bucket);
        debug!(
            "[State] rate limit {}/{}: {} per {}s",
            entity_type, entity_id, limit, window_secs
        );
        Ok(())
    }

    /// Consume a token for a rate-limited entity. Entities with no bucket
    /// are unconstrained. The bucket TTL extends only by refill.
    pub fn check_rate_limit(&self, entity_type: &str, entity_id: &str) -> bool {
        let key = (entity_type.to_string(), entity_id.to_string());
        let mut inner = self.inner.write();
        let Some(bucket) = inner.rate_limits.get_mut(&key) else {
            return true;
        };
        let now = now_secs();
        let allowed = bucket.try_consume(now);
        let (limit, window, tokens) = (bucket.limit, bucket.window_secs, bucket.tokens);
        let _ = self.memory.upsert_rate_limit(
            entity_type,
            entity_id,
            limit,
            window,
            tokens,
            now + window as i64,
        );
        if !allowed {
            warn!("[State] ⏱️ rate limit exceeded for {}/{}", entity_type, entity_id);
        }
        allowed
    }

    pub fn is_rate_limited(&self, entity_type: &str, entity_id: &str) -> bool {
        let key = (entity_type.to_string(), entity_id.to_string());
        self.inner
            .read()
            .rate_limits
            .get(&key)
            .map(|b| b.remaining() == 0)
            .unwrap_or(false)
    }

    // -- sweeping -------------------------------------------------------

    /// Drop expired blocks (TTL passed). Returns how many were removed.
    pub fn sweep_expired(&self) -> SocResult<usize> {
        let now = now_secs();
        let mut inner = self.inner.write();
        let expired: Vec<String> = inner
            .blocked_ips
            .iter()
            .filter(|(_, r)| now - r.blocked_at >= r.duration_secs as i64)
            .map(|(ip, _)| ip.clone())
            .collect();
        for ip in &expired {
            self.memory.remove_block(ip)?;
            inner.blocked_ips.remove(ip);
            info!("[State] block on {} expired", ip);
        }
        self.memory.purge_expired(now)?;
        Ok(expired.len())
    }
}

/// Contract every remediation adapter implements.
#[async_trait]
pub trait Effector: Send + Sync {
    fn name(&self) -> &'static str;
    async fn apply(&self, action: &Action, ttl: Option<u64>) -> SocResult<()>;
    async fn revoke(&self, action: &Action) -> SocResult<()>;
    fn healthy(&self) -> bool {
        true
    }
}

/// Default effector backed by the in-process remediation state. Cloud
/// adapters (firewall APIs etc.) register alongside it under the same trait.
pub struct StateEffector {
    state: Arc<RemediationState>,
    block_ttl_secs: u64,
    rate_limit_default: u32,
    rate_limit_window_secs: u64,
}

impl StateEffector {
    pub fn new(
        state: Arc<RemediationState>,
        block_ttl_secs: u64,
        rate_limit_default: u32,
        rate_limit_window_secs: u64,
    ) -> Self {
        StateEffector {
            state,
            block_ttl_secs,
            rate_limit_default,
            rate_limit_window_secs,
        }
    }
}

#[async_trait]
impl Effector for StateEffector {
    fn name(&self) -> &'static str {
        "state"
    }

    async fn apply(&self, action: &Action, ttl: Option<u64>) -> SocResult<()> {
        match action.kind.as_str() {
            "block_ip" => self.state.block_ip(
                &action.parameter,
                "remediation",
                "",
                ttl.unwrap_or(self.block_ttl_secs),
            ),
            "rate_limit_ip" => self.state.apply_rate_limit(
                "ip",
                &action.parameter,
                self.rate_limit_default,
                self.rate_limit_window_secs,
            ),
            "rate_limit_user" => self.state.apply_rate_limit(
                "user",
                &action.parameter,
                self.rate_limit_default,
                self.rate_limit_window_secs,
            ),
            "terminate_session" => self.state.terminate_session(&action.parameter),
            "suspend_user" => self.state.suspend_user(&action.parameter, "remediation"),
            "isolate_agent" => self.state.isolate_agent(&action.parameter),
            "flag_user" => self.state.flag_user(&action.parameter),
            "initiate_forensics" => {
                self.state.record_forensics(&action.parameter);
                Ok(())
            }
            "enable_enhanced_monitoring" => {
                self.state.enable_monitoring(&action.parameter, 4);
                Ok(())
            }
            "notify_compliance_team" => {
                self.state.record_notification(&action.parameter);
                Ok(())
            }
            "require_human_review" => {
                self.state.queue_for_review(&action.parameter);
                Ok(())
            }
            other => Err(SocError::Effector {
                effector: "state".to_string(),
                reason: format!("unsupported action kind '{}'", other),
            }),
        }
    }

    async fn revoke(&self, action: &Action) -> SocResult<()> {
        match action.kind.as_str() {
            "block_ip" => self.state.unblock_ip(&action.parameter).map(|_| ()),
            other => Err(SocError::Effector {
                effector: "state".to_string(),
                reason: format!("revoke unsupported for '{}'", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<RemediationState> {
        Arc::new(RemediationState::new(Arc::new(
            AgentMemory::in_memory().unwrap(),
        )))
    }

    #[test]
    fn token_bucket_denies_past_limit() {
        let mut bucket = TokenBucket::new(5, 120);
        let now = now_secs();
        for _ in 0..5 {
            assert!(bucket.try_consume(now));
        }
        assert!(!bucket.try_consume(now));
        // refill rate is limit/window: after 24s one token is back
        assert!(bucket.try_consume(now + 24));
        assert!(!bucket.try_consume(now + 24));
    }

    #[test]
    fn block_respects_ttl() {
        let s = state();
        s.block_ip("203.0.113.10", "test", "a-1", 3600).unwrap();
        assert!(s.is_ip_blocked("203.0.113.10"));
        assert!(!s.is_ip_blocked("203.0.113.11"));
        assert!(s.unblock_ip("203.0.113.10").unwrap());
        assert!(!s.is_ip_blocked("203.0.113.10"));
    }

    #[test]
    fn rate_limit_window_invariant() {
        let s = state();
        s.apply_rate_limit("user", "u-1", 3, 600).unwrap();
        let mut accepted = 0;
        for _ in 0..10 {
            if s.check_rate_limit("user", "u-1") {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 3);
        assert!(s.is_rate_limited("user", "u-1"));
        // unlimited entity passes
        assert!(s.check_rate_limit("user", "someone-else"));
    }

    #[tokio::test]
    async fn state_effector_dispatches_by_kind() {
        let s = state();
        let effector = StateEffector::new(s.clone(), 3600, 5, 120);

        effector
            .apply(&Action::new("terminate_session", "sess-9").unwrap(), None)
            .await
            .unwrap();
        assert!(s.is_session_terminated("sess-9"));

        effector
            .apply(&Action::new("flag_user", "u-7").unwrap(), None)
            .await
            .unwrap();
        assert!(s.is_user_flagged("u-7"));

        effector
            .apply(&Action::new("block_ip", "198.51.100.3").unwrap(), Some(60))
            .await
            .unwrap();
        assert!(s.is_ip_blocked("198.51.100.3"));
        effector
            .revoke(&Action::new("block_ip", "198.51.100.3").unwrap())
            .await
            .unwrap();
        assert!(!s.is_ip_blocked("198.51.100.3"));
    }
}
