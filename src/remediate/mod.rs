//! Remediator: playbook execution engine
//!
//! Validates, gates, approves, executes, retries and audits. Within one
//! playbook actions run sequentially in declared order; a worker pool
//! drains the queue concurrently across playbooks.

pub mod actions;
pub mod approval;
pub mod breaker;
pub mod effectors;
pub mod playbook;
pub mod policy;

use crate::audit::AuditChain;
use crate::core::config::RemediationConfig;
use crate::core::error::{SocError, SocResult};
use crate::core::queue::RemediatorQueue;
use crate::memory::AgentMemory;
use actions::{Action, CATALOGUE};
use approval::ApprovalWorkflow;
use breaker::{retry_with_backoff, CircuitBreaker};
use effectors::{Effector, RemediationState, StateEffector};
use parking_lot::RwLock;
use playbook::{Playbook, PlaybookStatus};
use policy::{ActionContext, PolicyDecision, PolicyEngine};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Per-action execution result, folded into the playbook terminal status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Completed,
    AlreadyDone,
    DryRunBlocked,
    DeniedByPolicy,
    Cancelled,
    Failed,
}

impl ActionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOutcome::Completed => "completed",
            ActionOutcome::AlreadyDone => "already_done",
            ActionOutcome::DryRunBlocked => "dry_run_blocked",
            ActionOutcome::DeniedByPolicy => "denied_by_policy",
            ActionOutcome::Cancelled => "cancelled",
            ActionOutcome::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionResult {
    pub kind: String,
    pub parameter: String,
    pub outcome: ActionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The execution engine.
pub struct Remediator {
    dry_run: bool,
    cfg: RemediationConfig,
    effectors: RwLock<HashMap<String, Arc<dyn Effector>>>,
    state: Arc<RemediationState>,
    memory: Arc<AgentMemory>,
    chain: Arc<AuditChain>,
    policy: Arc<PolicyEngine>,
    approvals: Arc<ApprovalWorkflow>,
    breaker: CircuitBreaker,
}

impl Remediator {
    pub fn new(
        cfg: RemediationConfig,
        state: Arc<RemediationState>,
        memory: Arc<AgentMemory>,
        chain: Arc<AuditChain>,
        policy: Arc<PolicyEngine>,
        approvals: Arc<ApprovalWorkflow>,
    ) -> Self {
        let default_effector: Arc<dyn Effector> = Arc::new(StateEffector::new(
            state.clone(),
            cfg.block_ttl_secs,
            cfg.rate_limit_default,
            cfg.rate_limit_window_secs,
        ));
        let mut effectors: HashMap<String, Arc<dyn Effector>> = HashMap::new();
        for spec in CATALOGUE {
            effectors.insert(spec.kind.to_string(), default_effector.clone());
        }

        Remediator {
            dry_run: !cfg.real_mode,
            breaker: CircuitBreaker::new(cfg.breaker_failure_threshold, cfg.breaker_cooldown_secs),
            cfg,
            effectors: RwLock::new(effectors),
            state,
            memory,
            chain,
            policy,
            approvals,
        }
    }

    /// Swap in a real adapter (cloud firewall, session service, ...) for one
    /// action kind.
    pub fn register_effector(&self, kind: &str, effector: Arc<dyn Effector>) {
        self.effectors.write().insert(kind.to_string(), effector);
    }

    pub fn state(&self) -> &Arc<RemediationState> {
        &self.state
    }

    pub fn approvals(&self) -> &Arc<ApprovalWorkflow> {
        &self.approvals
    }

    /// Whitelist-validated extraction. With the whitelist disabled (operator
    /// escape hatch) unknown kinds pass through treated as critical and
    /// real-mode-only, so dry-run gating still contains them.
    fn extract_actions(&self, playbook: &Playbook) -> SocResult<Vec<Action>> {
        match playbook.effective_actions() {
            Ok(actions) => Ok(actions),
            Err(e) if !self.cfg.enable_action_whitelist => {
                warn!("[Remediator] whitelist disabled, passing unvalidated actions: {}", e);
                let raw: Vec<(String, String)> = if !playbook.actions.is_empty() {
                    playbook
                        .actions
                        .iter()
                        .map(|a| (a.kind.clone(), a.parameter.clone()))
                        .collect()
                } else {
                    actions::parse_legacy_target(playbook.legacy_target.as_deref().unwrap_or(""))
                };
                Ok(raw
                    .into_iter()
                    .map(|(kind, parameter)| Action {
                        kind,
                        parameter: if self.cfg.enable_input_sanitization {
                            actions::sanitize_parameter(&parameter)
                        } else {
                            parameter
                        },
                        risk_level: crate::core::types::Severity::Critical,
                        requires_real_mode: true,
                    })
                    .collect())
            }
            Err(e) => Err(e),
        }
    }

    /// Idempotency fingerprint over the identifying fields of one action.
    fn fingerprint(playbook_id: &str, index: usize, kind: &str, parameter: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}|{}|{}|{}", playbook_id, index, kind, parameter).as_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn execute(&self, playbook: Playbook) -> SocResult<Playbook> {
        self.execute_cancellable(playbook, None).await
    }

    /// Full execution contract. A cancellation flag lets the caller stop
    /// between actions; the in-flight action always completes.
    pub async fn execute_cancellable(
        &self,
        mut playbook: Playbook,
        cancel: Option<Arc<AtomicBool>>,
    ) -> SocResult<Playbook> {
        // 1. Schema validation. Invalid intents never enter the state machine.
        if self.cfg.enable_schema_validation {
            if let Err(e) = playbook.validate_schema() {
                playbook.status = PlaybookStatus::Failed;
                playbook.execution_result = Some(json!({ "reason": "schema_invalid", "detail": e.to_string() }));
                self.audit_playbook(&playbook, "playbook.schema_invalid", json!({ "detail": e.to_string() }));
                self.approvals.update(&playbook);
                return Ok(playbook);
            }
        }

        // 2-3. Action extraction: canonical field, legacy fallback. Each
        //      action passes whitelist + sanitization + format validation.
        let extracted = match self.extract_actions(&playbook) {
            Ok(actions) if !actions.is_empty() => actions,
            Ok(_) => {
                playbook.status = PlaybookStatus::Failed;
                playbook.execution_result =
                    Some(json!({ "reason": "invalid_actions", "detail": "no actions" }));
                self.audit_playbook(&playbook, "playbook.invalid_actions", json!({}));
                self.approvals.update(&playbook);
                return Ok(playbook);
            }
            Err(e) => {
                let detail = e.to_string();
                playbook.status = PlaybookStatus::Failed;
                playbook.execution_result =
                    Some(json!({ "reason": "invalid_actions", "detail": detail }));
                self.audit_playbook(&playbook, "playbook.invalid_actions", json!({ "detail": detail }));
                self.approvals.update(&playbook);
                return Ok(playbook);
            }
        };

        // Intake: pending playbooks move to dry_run automatically.
        if playbook.status == PlaybookStatus::Pending {
            playbook.transition(PlaybookStatus::DryRun)?;
        }

        // 5. Policy evaluation across all actions decides the gate.
        let outcomes: Vec<_> = extracted
            .iter()
            .map(|a| {
                self.policy.evaluate(&ActionContext {
                    kind: &a.kind,
                    parameter: &a.parameter,
                    environment: &playbook.environment,
                    risk_level: a.risk_level,
                })
            })
            .collect();

        let needs_approval = outcomes
            .iter()
            .any(|o| o.decision == PolicyDecision::RequireApproval);
        if needs_approval && playbook.status != PlaybookStatus::Approved {
            // Park for a signed decision; the playbook re-enters the queue
            // once an approver signs it.
            if self.approvals.get(&playbook.id).is_none() {
                self.approvals.create(playbook.clone())?;
            } else {
                self.approvals.update(&playbook);
            }
            let parked = self.approvals.request_approval(&playbook.id)?;
            info!("[Remediator] {} parked pending approval", parked.id);
            return Ok(parked);
        }

        if playbook.status == PlaybookStatus::DryRun {
            // Automatic approval: policy did not demand a signature.
            playbook.transition(PlaybookStatus::Approved)?;
        }
        playbook.transition(PlaybookStatus::Executing)?;
        playbook.executed_by = Some("remediator".to_string());

        // 6-8. Sequential action execution with idempotency, retries,
        // breakers and a signed audit entry per result.
        let mut results: Vec<ActionResult> = Vec::with_capacity(extracted.len());
        let mut cancelled = false;

        for (index, (action, policy_outcome)) in extracted.iter().zip(outcomes.iter()).enumerate() {
            if let Some(flag) = &cancel {
                if flag.load(Ordering::Acquire) {
                    cancelled = true;
                    results.push(self.finish_action(
                        &playbook,
                        index,
                        action,
                        ActionOutcome::Cancelled,
                        Some("cancelled before dispatch".to_string()),
                    ));
                    continue;
                }
            }

            if policy_outcome.decision == PolicyDecision::Deny {
                results.push(self.finish_action(
                    &playbook,
                    index,
                    action,
                    ActionOutcome::DeniedByPolicy,
                    Some(format!("policy rule '{}'", policy_outcome.rule)),
                ));
                continue;
            }

            // 4. Dry-run gating.
            let effective_dry_run =
                self.dry_run || policy_outcome.decision == PolicyDecision::DryRunOnly;
            if effective_dry_run && action.is_high_risk() {
                warn!(
                    "[DRY-RUN] blocked high-risk action: {}:{}",
                    action.kind, action.parameter
                );
                results.push(self.finish_action(
                    &playbook,
                    index,
                    action,
                    ActionOutcome::DryRunBlocked,
                    None,
                ));
                continue;
            }

            // 6. Idempotency.
            let fingerprint = Self::fingerprint(&playbook.id, index, &action.kind, &action.parameter);
            if self.memory.was_executed(&fingerprint).unwrap_or(false) {
                results.push(self.finish_action(
                    &playbook,
                    index,
                    action,
                    ActionOutcome::AlreadyDone,
                    None,
                ));
                continue;
            }

            // 7. Dispatch with retries behind the circuit breaker.
            if !self.breaker.allow(&action.kind) {
                results.push(self.finish_action(
                    &playbook,
                    index,
                    action,
                    ActionOutcome::Failed,
                    Some("circuit open".to_string()),
                ));
                continue;
            }

            let effector = self.effectors.read().get(&action.kind).cloned();
            let Some(effector) = effector else {
                results.push(self.finish_action(
                    &playbook,
                    index,
                    action,
                    ActionOutcome::Failed,
                    Some("no effector registered".to_string()),
                ));
                continue;
            };

            let timeout = Duration::from_millis(self.cfg.effector_timeout_ms);
            let ttl = (action.kind == "block_ip").then_some(self.cfg.block_ttl_secs);
            let call = retry_with_backoff(|| {
                let effector = effector.clone();
                let action = action.clone();
                async move {
                    match tokio::time::timeout(timeout, effector.apply(&action, ttl)).await {
                        Ok(result) => result,
                        Err(_) => Err(SocError::Timeout(timeout.as_millis() as u64)),
                    }
                }
            })
            .await;

            match call {
                Ok(()) => {
                    self.breaker.record_success(&action.kind);
                    let _ = self.memory.record_execution(&fingerprint, &playbook.id);
                    results.push(self.finish_action(
                        &playbook,
                        index,
                        action,
                        ActionOutcome::Completed,
                        None,
                    ));
                }
                Err(e) => {
                    self.breaker.record_failure(&action.kind);
                    results.push(self.finish_action(
                        &playbook,
                        index,
                        action,
                        ActionOutcome::Failed,
                        Some(e.to_string()),
                    ));
                }
            }
        }

        // 9. Terminal status is the worst outcome across actions.
        let any_failed = results
            .iter()
            .any(|r| matches!(r.outcome, ActionOutcome::Failed | ActionOutcome::Cancelled));
        let action_count = results.len();
        playbook.execution_result = Some(json!({
            "results": results,
            "cancelled": cancelled,
        }));
        playbook.transition(if any_failed {
            PlaybookStatus::Failed
        } else {
            PlaybookStatus::Completed
        })?;

        self.audit_playbook(
            &playbook,
            if any_failed { "playbook.failed" } else { "playbook.completed" },
            json!({ "actions": action_count, "cancelled": cancelled }),
        );
        self.approvals.update(&playbook);
        Ok(playbook)
    }

    fn finish_action(
        &self,
        playbook: &Playbook,
        index: usize,
        action: &Action,
        outcome: ActionOutcome,
        detail: Option<String>,
    ) -> ActionResult {
        let entry = self.chain.append(
            &format!("action.{}", outcome.as_str()),
            "remediator",
            json!({
                "playbook_id": playbook.id,
                "index": index,
                "kind": action.kind,
                "parameter": action.parameter,
                "detail": &detail,
            }),
        );
        let _ = self.memory.store_audit_entry(&entry);
        let _ = self.memory.store_remediation_decision(
            &playbook.id,
            &playbook.alert_id,
            &action.kind,
            &action.parameter,
            outcome.as_str(),
            detail.as_deref(),
        );
        ActionResult {
            kind: action.kind.clone(),
            parameter: action.parameter.clone(),
            outcome,
            detail,
        }
    }

    fn audit_playbook(&self, playbook: &Playbook, event: &str, payload: serde_json::Value) {
        let mut body = payload;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("playbook_id".to_string(), json!(playbook.id));
            obj.insert("alert_id".to_string(), json!(playbook.alert_id));
        }
        let entry = self.chain.append(event, "remediator", body);
        let _ = self.memory.store_audit_entry(&entry);
    }
}

/// Spawn the worker pool draining the queue. Workers exit when the queue is
/// shut down and drained.
pub fn spawn_workers(
    remediator: Arc<Remediator>,
    queue: Arc<RemediatorQueue<Playbook>>,
    count: usize,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker| {
            let remediator = remediator.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                info!("[Remediator] worker {} online", worker);
                while let Some(playbook) = queue.dequeue().await {
                    let id = playbook.id.clone();
                    if let Err(e) = remediator.execute(playbook).await {
                        warn!("[Remediator] worker {} failed on {}: {}", worker, id, e);
                    }
                }
                info!("[Remediator] worker {} drained", worker);
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::identity::{Identity, TrustStore, CAP_APPROVER};

    struct Fixture {
        remediator: Remediator,
        approver: Identity,
        chain: Arc<AuditChain>,
        state: Arc<RemediationState>,
        memory: Arc<AgentMemory>,
    }

    fn fixture(real_mode: bool) -> Fixture {
        let mut cfg = crate::core::config::SocConfig::default().remediation;
        cfg.real_mode = real_mode;

        let memory = Arc::new(AgentMemory::in_memory().unwrap());
        let chain = Arc::new(AuditChain::new(Identity::generate("soc-runtime")));
        let trust = Arc::new(TrustStore::new());
        let approver = Identity::generate("alice");
        trust.add_identity(&approver, &[CAP_APPROVER]).unwrap();

        let state = Arc::new(RemediationState::new(memory.clone()));
        let approvals = Arc::new(ApprovalWorkflow::new(
            chain.clone(),
            trust,
            memory.clone(),
            86_400,
        ));
        let remediator = Remediator::new(
            cfg,
            state.clone(),
            memory.clone(),
            chain.clone(),
            Arc::new(PolicyEngine::new()),
            approvals,
        );
        Fixture {
            remediator,
            approver,
            chain,
            state,
            memory,
        }
    }

    fn playbook(actions: Vec<Action>, environment: &str) -> Playbook {
        let mut pb = Playbook::new("a-1", "soc_analyst", "test", actions);
        pb.environment = environment.to_string();
        pb
    }

    #[tokio::test]
    async fn low_risk_playbook_completes_in_dev() {
        let f = fixture(false);
        let pb = playbook(
            vec![
                Action::new("flag_user", "u-1").unwrap(),
                Action::new("enable_enhanced_monitoring", "sess-1").unwrap(),
            ],
            "development",
        );
        let done = f.remediator.execute(pb).await.unwrap();
        assert_eq!(done.status, PlaybookStatus::Completed);
        assert!(f.state.is_user_flagged("u-1"));
        assert!(f.state.is_monitored("sess-1"));
        // one audit entry per action, in order
        let entries = f.chain.entries_of_type("action.completed");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].payload["kind"], "flag_user");
        assert_eq!(entries[1].payload["kind"], "enable_enhanced_monitoring");
    }

    #[tokio::test]
    async fn destructive_playbook_parks_for_approval() {
        let f = fixture(true);
        let pb = playbook(
            vec![
                Action::new("block_ip", "203.0.113.10").unwrap(),
                Action::new("terminate_session", "sess-2").unwrap(),
            ],
            "production",
        );
        let parked = f.remediator.execute(pb).await.unwrap();
        assert_eq!(parked.status, PlaybookStatus::Pending);
        assert!(!f.state.is_ip_blocked("203.0.113.10"));

        // approval unlocks execution
        let approved = f.remediator.approvals().approve(&parked.id, &f.approver).unwrap();
        let done = f.remediator.execute(approved).await.unwrap();
        assert_eq!(done.status, PlaybookStatus::Completed);
        assert!(f.state.is_ip_blocked("203.0.113.10"));
        assert!(f.state.is_session_terminated("sess-2"));
    }

    #[tokio::test]
    async fn dry_run_blocks_high_risk_actions() {
        let f = fixture(false);
        let pb = playbook(
            vec![Action::new("block_ip", "198.51.100.9").unwrap()],
            "development",
        );
        // public IP + destructive kind -> approval; approve then run in dry-run
        let parked = f.remediator.execute(pb).await.unwrap();
        let approved = f.remediator.approvals().approve(&parked.id, &f.approver).unwrap();
        let done = f.remediator.execute(approved).await.unwrap();

        assert_eq!(done.status, PlaybookStatus::Completed);
        // dry-run: no observable effect on remediation state
        assert!(!f.state.is_ip_blocked("198.51.100.9"));
        assert_eq!(f.chain.entries_of_type("action.dry_run_blocked").len(), 1);
    }

    #[tokio::test]
    async fn loopback_block_is_denied_not_executed() {
        let f = fixture(true);
        let pb = playbook(
            vec![Action::new("block_ip", "127.0.0.1").unwrap()],
            "development",
        );
        // loopback deny (priority 10) beats destructive approval (25)
        let done = f.remediator.execute(pb).await.unwrap();
        assert_eq!(done.status, PlaybookStatus::Completed);
        assert!(!f.state.is_ip_blocked("127.0.0.1"));
        assert_eq!(f.chain.entries_of_type("action.denied_by_policy").len(), 1);
    }

    #[tokio::test]
    async fn execute_twice_is_idempotent() {
        let f = fixture(false);
        let pb = playbook(vec![Action::new("flag_user", "u-9").unwrap()], "development");
        let done = f.remediator.execute(pb).await.unwrap();
        assert_eq!(done.status, PlaybookStatus::Completed);

        // replay the completed playbook's actions under the same id
        let mut replay = done.clone();
        replay.status = PlaybookStatus::Approved;
        replay.execution_result = None;
        let second = f.remediator.execute(replay).await.unwrap();
        assert_eq!(second.status, PlaybookStatus::Completed);
        let results = second.execution_result.unwrap();
        assert_eq!(results["results"][0]["outcome"], "already_done");
    }

    #[tokio::test]
    async fn schema_invalid_playbook_fails_fast() {
        let f = fixture(false);
        let pb = playbook(Vec::new(), "development");
        let done = f.remediator.execute(pb).await.unwrap();
        assert_eq!(done.status, PlaybookStatus::Failed);
        assert_eq!(
            done.execution_result.unwrap()["reason"],
            "schema_invalid"
        );
    }

    #[tokio::test]
    async fn legacy_target_playbook_executes() {
        let f = fixture(false);
        let mut pb = Playbook::from_legacy("a-2", "operator", "legacy path", "flag_user:u-44");
        pb.environment = "development".to_string();
        let done = f.remediator.execute(pb).await.unwrap();
        assert_eq!(done.status, PlaybookStatus::Completed);
        assert!(f.state.is_user_flagged("u-44"));
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_actions() {
        let f = fixture(false);
        let cancel = Arc::new(AtomicBool::new(true));
        let pb = playbook(
            vec![
                Action::new("flag_user", "u-5").unwrap(),
                Action::new("enable_enhanced_monitoring", "sess-5").unwrap(),
            ],
            "development",
        );
        let done = f
            .remediator
            .execute_cancellable(pb, Some(cancel))
            .await
            .unwrap();
        assert_eq!(done.status, PlaybookStatus::Failed);
        assert!(!f.state.is_user_flagged("u-5"));
        let _ = &f.memory;
    }
}
