//! Approval workflow
//!
//! Wraps playbooks in a dry-run + signed-approval state machine. Every
//! transition lands in the audit chain; approvals halt entirely while the
//! chain is sealed after a tamper event.

use crate::audit::identity::{Identity, TrustStore, CAP_APPROVER};
use crate::audit::AuditChain;
use crate::core::error::{SocError, SocResult};
use crate::core::types::now_secs;
use crate::memory::AgentMemory;
use crate::remediate::playbook::{Playbook, PlaybookStatus};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of simulating a playbook without touching external state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DryRunReport {
    pub playbook_id: String,
    pub actions: Vec<ActionValidation>,
    /// Estimated blast radius: would-be executions per action kind.
    pub blast_radius: HashMap<String, usize>,
    pub all_valid: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionValidation {
    pub kind: String,
    pub parameter: String,
    pub valid: bool,
    pub reason: Option<String>,
}

/// Dry-run gating plus the signed approval state machine over playbooks.
pub struct ApprovalWorkflow {
    playbooks: RwLock<HashMap<String, Playbook>>,
    chain: Arc<AuditChain>,
    trust: Arc<TrustStore>,
    memory: Arc<AgentMemory>,
    approval_ttl_secs: u64,
}

impl ApprovalWorkflow {
    pub fn new(
        chain: Arc<AuditChain>,
        trust: Arc<TrustStore>,
        memory: Arc<AgentMemory>,
        approval_ttl_secs: u64,
    ) -> Self {
        ApprovalWorkflow {
            playbooks: RwLock::new(HashMap::new()),
            chain,
            trust,
            memory,
            approval_ttl_secs,
        }
    }

    fn persist(&self, playbook: &Playbook) {
        let json = serde_json::to_string(playbook).unwrap_or_default();
        if let Err(e) =
            self.memory
                .store_playbook(&playbook.id, &playbook.alert_id, &json, playbook.status.as_str())
        {
            warn!("[Approval] persist failed for {}: {}", playbook.id, e);
        }
    }

    /// Intake: a fresh playbook moves straight into dry-run.
    pub fn create(&self, mut playbook: Playbook) -> SocResult<Playbook> {
        if playbook.status == PlaybookStatus::Pending {
            playbook.transition(PlaybookStatus::DryRun)?;
        }
        self.chain.append(
            "playbook.created",
            &playbook.created_by,
            json!({ "playbook_id": playbook.id, "alert_id": playbook.alert_id }),
        );
        self.persist(&playbook);
        let stored = playbook.clone();
        self.playbooks.write().insert(playbook.id.clone(), playbook);
        Ok(stored)
    }

    pub fn get(&self, id: &str) -> Option<Playbook> {
        self.playbooks.read().get(id).cloned()
    }

    /// Simulate: validate every action and estimate blast radius. No
    /// external state changes.
    pub fn execute_dry_run(&self, id: &str) -> SocResult<DryRunReport> {
        let mut playbooks = self.playbooks.write();
        let playbook = playbooks
            .get_mut(id)
            .ok_or_else(|| SocError::Validation(format!("unknown playbook '{}'", id)))?;

        let mut validations = Vec::new();
        let mut blast_radius: HashMap<String, usize> = HashMap::new();

        match playbook.effective_actions() {
            Ok(actions) => {
                for action in &actions {
                    *blast_radius.entry(action.kind.clone()).or_insert(0) += 1;
                    validations.push(ActionValidation {
                        kind: action.kind.clone(),
                        parameter: action.parameter.clone(),
                        valid: true,
                        reason: None,
                    });
                }
            }
            Err(e) => {
                validations.push(ActionValidation {
                    kind: "*".to_string(),
                    parameter: String::new(),
                    valid: false,
                    reason: Some(e.to_string()),
                });
            }
        }

        let report = DryRunReport {
            playbook_id: id.to_string(),
            all_valid: validations.iter().all(|v| v.valid),
            actions: validations,
            blast_radius,
        };
        playbook.dry_run_result = serde_json::to_value(&report).ok();
        self.chain.append(
            "playbook.dry_run",
            &playbook.owner,
            json!({ "playbook_id": id, "all_valid": report.all_valid }),
        );
        self.persist(playbook);
        Ok(report)
    }

    /// Park the playbook awaiting a signed decision; it expires after the
    /// approval TTL.
    pub fn request_approval(&self, id: &str) -> SocResult<Playbook> {
        let mut playbooks = self.playbooks.write();
        let playbook = playbooks
            .get_mut(id)
            .ok_or_else(|| SocError::Validation(format!("unknown playbook '{}'", id)))?;
        playbook.transition(PlaybookStatus::Pending)?;
        playbook.expires_at = Some(now_secs() + self.approval_ttl_secs as i64);
        self.chain.append(
            "approval.requested",
            &playbook.owner,
            json!({ "playbook_id": id, "expires_at": playbook.expires_at }),
        );
        self.persist(playbook);
        Ok(playbook.clone())
    }

    fn approval_bytes(decision: &str, playbook_id: &str, approver: &str) -> Vec<u8> {
        format!("{}|{}|{}", decision, playbook_id, approver).into_bytes()
    }

    /// Apply a signed approval. Requires the `approver` capability, a valid
    /// signature, an unexpired request, and an intact audit chain.
    pub fn approve(&self, id: &str, approver: &Identity) -> SocResult<Playbook> {
        if self.chain.is_sealed() {
            return Err(SocError::Integrity {
                index: 0,
                reason: "audit chain sealed; approvals halted".to_string(),
            });
        }
        if !self.trust.has_capability(&approver.principal, CAP_APPROVER) {
            self.chain.append(
                "approval.rejected_unauthorized",
                &approver.principal,
                json!({ "playbook_id": id }),
            );
            return Err(SocError::Authorization(format!(
                "principal '{}' lacks the approver capability",
                approver.principal
            )));
        }

        let signature = approver.sign(&Self::approval_bytes("approve", id, &approver.principal));
        if !self.trust.verify(
            &approver.principal,
            &Self::approval_bytes("approve", id, &approver.principal),
            &signature,
        ) {
            return Err(SocError::Authorization(
                "approval signature did not verify against the trust store".to_string(),
            ));
        }

        let mut playbooks = self.playbooks.write();
        let playbook = playbooks
            .get_mut(id)
            .ok_or_else(|| SocError::Validation(format!("unknown playbook '{}'", id)))?;

        if playbook.is_expired(now_secs()) {
            playbook.transition(PlaybookStatus::Expired)?;
            self.persist(playbook);
            return Err(SocError::Validation(format!(
                "approval window for '{}' has expired",
                id
            )));
        }

        // pending (awaiting approval) moves through dry_run to approved
        if playbook.status == PlaybookStatus::Pending {
            playbook.transition(PlaybookStatus::DryRun)?;
        }
        playbook.transition(PlaybookStatus::Approved)?;
        playbook.approved_by = Some(approver.principal.clone());
        playbook.signature = Some(signature.clone());

        self.chain.append(
            "approval.granted",
            &approver.principal,
            json!({ "playbook_id": id, "signature": signature }),
        );
        let _ = self
            .memory
            .store_approval(id, &approver.principal, "approve", None, &signature);
        self.persist(playbook);
        info!("[Approval] ✅ {} approved by {}", id, approver.principal);
        Ok(playbook.clone())
    }

    pub fn reject(&self, id: &str, approver: &Identity, reason: &str) -> SocResult<Playbook> {
        if !self.trust.has_capability(&approver.principal, CAP_APPROVER) {
            return Err(SocError::Authorization(format!(
                "principal '{}' lacks the approver capability",
                approver.principal
            )));
        }
        let signature = approver.sign(&Self::approval_bytes("reject", id, &approver.principal));

        let mut playbooks = self.playbooks.write();
        let playbook = playbooks
            .get_mut(id)
            .ok_or_else(|| SocError::Validation(format!("unknown playbook '{}'", id)))?;
        playbook.transition(PlaybookStatus::Rejected)?;

        self.chain.append(
            "approval.rejected",
            &approver.principal,
            json!({ "playbook_id": id, "reason": reason }),
        );
        let _ = self
            .memory
            .store_approval(id, &approver.principal, "reject", Some(reason), &signature);
        self.persist(playbook);
        warn!("[Approval] ❌ {} rejected by {}: {}", id, approver.principal, reason);
        Ok(playbook.clone())
    }

    /// Sweep: transition overdue approvals to expired.
    pub fn expire_overdue(&self) -> Vec<String> {
        let now = now_secs();
        let mut expired = Vec::new();
        let mut playbooks = self.playbooks.write();
        for (id, playbook) in playbooks.iter_mut() {
            if !playbook.status.is_terminal() && playbook.is_expired(now) {
                if playbook.transition(PlaybookStatus::Expired).is_ok() {
                    self.chain.append(
                        "approval.expired",
                        "sweeper",
                        json!({ "playbook_id": id }),
                    );
                    self.persist(playbook);
                    expired.push(id.clone());
                }
            }
        }
        if !expired.is_empty() {
            info!("[Approval] expired {} overdue playbooks", expired.len());
        }
        expired
    }

    /// Record the post-execution form of a playbook.
    pub fn update(&self, playbook: &Playbook) {
        self.persist(playbook);
        self.playbooks
            .write()
            .insert(playbook.id.clone(), playbook.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remediate::actions::Action;

    struct Fixture {
        workflow: ApprovalWorkflow,
        approver: Identity,
        bystander: Identity,
        chain: Arc<AuditChain>,
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(AuditChain::new(Identity::generate("soc-runtime")));
        let trust = Arc::new(TrustStore::new());
        let approver = Identity::generate("alice");
        let bystander = Identity::generate("bob");
        trust.add_identity(&approver, &[CAP_APPROVER]).unwrap();
        trust.add_identity(&bystander, &[]).unwrap();
        let memory = Arc::new(AgentMemory::in_memory().unwrap());
        Fixture {
            workflow: ApprovalWorkflow::new(chain.clone(), trust, memory, 86_400),
            approver,
            bystander,
            chain,
        }
    }

    fn playbook() -> Playbook {
        Playbook::new(
            "a-1",
            "soc_analyst",
            "block attacker",
            vec![Action::new("block_ip", "203.0.113.10").unwrap()],
        )
    }

    #[test]
    fn create_moves_to_dry_run_and_audits() {
        let f = fixture();
        let pb = f.workflow.create(playbook()).unwrap();
        assert_eq!(pb.status, PlaybookStatus::DryRun);
        assert_eq!(f.chain.len(), 1);
    }

    #[test]
    fn dry_run_reports_blast_radius() {
        let f = fixture();
        let pb = f.workflow.create(playbook()).unwrap();
        let report = f.workflow.execute_dry_run(&pb.id).unwrap();
        assert!(report.all_valid);
        assert_eq!(report.blast_radius.get("block_ip"), Some(&1));
    }

    #[test]
    fn approve_requires_capability() {
        let f = fixture();
        let pb = f.workflow.create(playbook()).unwrap();
        f.workflow.request_approval(&pb.id).unwrap();

        let denied = f.workflow.approve(&pb.id, &f.bystander);
        assert!(matches!(denied, Err(SocError::Authorization(_))));
        // the unauthorized attempt itself is audited
        assert!(!f.chain.entries_of_type("approval.rejected_unauthorized").is_empty());

        let approved = f.workflow.approve(&pb.id, &f.approver).unwrap();
        assert_eq!(approved.status, PlaybookStatus::Approved);
        assert!(approved.signature.is_some());
        assert_eq!(approved.approved_by.as_deref(), Some("alice"));
    }

    #[test]
    fn sealed_chain_halts_approvals() {
        let f = fixture();
        let pb = f.workflow.create(playbook()).unwrap();
        f.workflow.request_approval(&pb.id).unwrap();

        f.chain.tamper_payload_for_test(0, json!({"forged": true}));
        assert!(f.chain.verify().is_err());

        let halted = f.workflow.approve(&pb.id, &f.approver);
        assert!(matches!(halted, Err(SocError::Integrity { .. })));
    }

    #[test]
    fn overdue_approvals_expire() {
        let f = fixture();
        let pb = f.workflow.create(playbook()).unwrap();
        f.workflow.request_approval(&pb.id).unwrap();

        // force the deadline into the past
        {
            let mut books = f.workflow.playbooks.write();
            books.get_mut(&pb.id).unwrap().expires_at = Some(now_secs() - 10);
        }
        let expired = f.workflow.expire_overdue();
        assert_eq!(expired, vec![pb.id.clone()]);
        assert_eq!(f.workflow.get(&pb.id).unwrap().status, PlaybookStatus::Expired);

        let late = f.workflow.approve(&pb.id, &f.approver);
        assert!(late.is_err());
    }

    #[test]
    fn reject_requires_capability_too() {
        let f = fixture();
        let pb = f.workflow.create(playbook()).unwrap();
        assert!(f.workflow.reject(&pb.id, &f.bystander, "nope").is_err());
        let rejected = f.workflow.reject(&pb.id, &f.approver, "too broad").unwrap();
        assert_eq!(rejected.status, PlaybookStatus::Rejected);
    }
}
