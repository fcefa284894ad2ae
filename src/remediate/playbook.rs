//! Playbooks: an intent to remediate
//!
//! The canonical action list plus the backward-compatible single-string
//! target form, and the status state machine the Remediator drives.

use crate::core::error::{SocError, SocResult};
use crate::core::types::{generate_id, now_secs};
use crate::remediate::actions::{parse_legacy_target, Action};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybookStatus {
    Pending,
    DryRun,
    Approved,
    Rejected,
    Executing,
    Completed,
    Failed,
    Expired,
}

impl PlaybookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybookStatus::Pending => "pending",
            PlaybookStatus::DryRun => "dry_run",
            PlaybookStatus::Approved => "approved",
            PlaybookStatus::Rejected => "rejected",
            PlaybookStatus::Executing => "executing",
            PlaybookStatus::Completed => "completed",
            PlaybookStatus::Failed => "failed",
            PlaybookStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlaybookStatus::Completed
                | PlaybookStatus::Failed
                | PlaybookStatus::Rejected
                | PlaybookStatus::Expired
        )
    }

    fn can_transition(&self, to: PlaybookStatus) -> bool {
        use PlaybookStatus::*;
        // Any non-terminal state may expire.
        if to == Expired && !self.is_terminal() {
            return true;
        }
        matches!(
            (self, to),
            (Pending, DryRun)
                | (Pending, Rejected)
                | (DryRun, Pending)
                | (DryRun, Approved)
                | (DryRun, Rejected)
                | (Approved, Executing)
                | (Executing, Completed)
                | (Executing, Failed)
        )
    }
}

/// Ordered remediation intent produced by the Analyst.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Playbook {
    pub id: String,
    pub alert_id: String,
    pub created_at: i64,
    pub owner: String,
    pub justification: String,
    /// Canonical field; new code always emits this.
    pub actions: Vec<Action>,
    /// Comma-joined `kind:parameter` fallback accepted on ingress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_target: Option<String>,
    /// Deployment environment the alert fired in; policy evaluation uses
    /// this. Unknown defaults to production (the strictest posture).
    #[serde(default = "default_environment")]
    pub environment: String,
    pub status: PlaybookStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<Value>,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_by: Option<String>,
}

fn default_environment() -> String {
    "production".to_string()
}

impl Playbook {
    pub fn new(alert_id: &str, owner: &str, justification: &str, actions: Vec<Action>) -> Self {
        Playbook {
            id: generate_id("pb"),
            alert_id: alert_id.to_string(),
            created_at: now_secs(),
            owner: owner.to_string(),
            justification: justification.to_string(),
            actions,
            legacy_target: None,
            environment: default_environment(),
            status: PlaybookStatus::Pending,
            expires_at: None,
            signature: None,
            dry_run_result: None,
            execution_result: None,
            created_by: owner.to_string(),
            approved_by: None,
            executed_by: None,
        }
    }

    /// Accept the legacy single-string form on ingress.
    pub fn from_legacy(alert_id: &str, owner: &str, justification: &str, target: &str) -> Self {
        let mut playbook = Playbook::new(alert_id, owner, justification, Vec::new());
        playbook.legacy_target = Some(target.to_string());
        playbook
    }

    /// Canonical actions, falling back to the parsed legacy target. Every
    /// returned action is freshly validated against the catalogue.
    pub fn effective_actions(&self) -> SocResult<Vec<Action>> {
        if !self.actions.is_empty() {
            return self.actions.iter().map(|a| a.revalidate()).collect();
        }
        let target = self.legacy_target.as_deref().unwrap_or("");
        parse_legacy_target(target)
            .iter()
            .map(|(kind, param)| Action::new(kind, param))
            .collect()
    }

    /// Enforce the status state machine.
    pub fn transition(&mut self, to: PlaybookStatus) -> SocResult<()> {
        if !self.status.can_transition(to) {
            return Err(SocError::Validation(format!(
                "invalid playbook transition {} -> {}",
                self.status.as_str(),
                to.as_str()
            )));
        }
        self.status = to;
        Ok(())
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.map(|t| now >= t).unwrap_or(false)
    }

    /// Structural validation ahead of execution.
    pub fn validate_schema(&self) -> SocResult<()> {
        if self.id.is_empty() || self.id.len() > 100 {
            return Err(SocError::Validation("playbook id malformed".to_string()));
        }
        if self.alert_id.is_empty() {
            return Err(SocError::Validation("playbook missing alert_id".to_string()));
        }
        if self.actions.is_empty() && self.legacy_target.as_deref().unwrap_or("").is_empty() {
            return Err(SocError::Validation(
                "playbook carries no actions".to_string(),
            ));
        }
        if self.justification.len() > 4000 {
            return Err(SocError::Validation("justification oversized".to_string()));
        }
        Ok(())
    }
}
