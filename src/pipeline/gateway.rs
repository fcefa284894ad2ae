//! Chat ingress gateway
//!
//! The contract the web frontend consumes: one chat request in, one
//! response out, with the security verdict and a step-by-step workflow log
//! attached. Enforcement checks (blocks, suspensions, terminated sessions,
//! rate limits) run before detection; confirmed threats get a policy
//! refusal instead of a model reply.

use crate::core::config::SocConfig;
use crate::core::types::{now_secs, DecisionKind, LogEntry, Severity, ThreatType};
use crate::llm::LlmClient;
use crate::pipeline::analyst::Analyst;
use crate::pipeline::builder::Builder;
use crate::remediate::effectors::RemediationState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub user_id: String,
    pub session_id: String,
    pub src_ip: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    /// One of "default", "security_aware", "strict".
    #[serde(default = "default_mode")]
    pub security_mode: String,
    #[serde(default)]
    pub auto_remediation: bool,
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_mode() -> String {
    "default".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecurityCheck {
    pub threat_detected: bool,
    pub severity: Option<Severity>,
    pub threat_type: Option<ThreatType>,
    pub false_positive_probability: f64,
    pub detection_method: Option<String>,
    pub remediation_actions: Vec<String>,
}

impl SecurityCheck {
    fn clean() -> Self {
        SecurityCheck {
            threat_detected: false,
            severity: None,
            threat_type: None,
            false_positive_probability: 0.0,
            detection_method: None,
            remediation_actions: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step: String,
    pub status: String,
    pub message: String,
    pub ts: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    pub blocked: bool,
    pub security_check: SecurityCheck,
    pub session_id: String,
    pub workflow_log: Vec<WorkflowStep>,
}

struct WorkflowLog(Vec<WorkflowStep>);

impl WorkflowLog {
    fn new() -> Self {
        WorkflowLog(Vec::new())
    }

    fn push(&mut self, step: &str, status: &str, message: impl Into<String>) {
        self.0.push(WorkflowStep {
            step: step.to_string(),
            status: status.to_string(),
            message: message.into(),
            ts: now_secs(),
        });
    }
}

/// Front door of the pipeline.
pub struct Gateway {
    config: SocConfig,
    builder: Arc<Builder>,
    analyst: Arc<Analyst>,
    state: Arc<RemediationState>,
    llm: Arc<LlmClient>,
}

impl Gateway {
    pub fn new(
        config: SocConfig,
        builder: Arc<Builder>,
        analyst: Arc<Analyst>,
        state: Arc<RemediationState>,
        llm: Arc<LlmClient>,
    ) -> Self {
        Gateway {
            config,
            builder,
            analyst,
            state,
            llm,
        }
    }

    fn refusal(
        request: &ChatRequest,
        log: WorkflowLog,
        security_check: SecurityCheck,
        reason: &str,
    ) -> ChatResponse {
        ChatResponse {
            response: reason.to_string(),
            blocked: true,
            security_check,
            session_id: request.session_id.clone(),
            workflow_log: log.0,
        }
    }

    /// Run one chat request through enforcement, detection, analysis and
    /// (optionally) remediation.
    pub async fn handle_chat(&self, request: ChatRequest) -> ChatResponse {
        let mut log = WorkflowLog::new();
        log.push("received", "ok", format!("session {}", request.session_id));

        // Standing enforcement comes before detection.
        if !request.src_ip.is_empty() && self.state.is_ip_blocked(&request.src_ip) {
            log.push("enforcement", "blocked", "source address is blocked");
            return Self::refusal(
                &request,
                log,
                SecurityCheck::clean(),
                "Access denied: your source address is currently blocked.",
            );
        }
        if !request.user_id.is_empty() && self.state.is_user_suspended(&request.user_id) {
            log.push("enforcement", "blocked", "user account suspended");
            return Self::refusal(
                &request,
                log,
                SecurityCheck::clean(),
                "Access denied: this account is suspended pending review.",
            );
        }
        if !request.session_id.is_empty() && self.state.is_session_terminated(&request.session_id) {
            log.push("enforcement", "blocked", "session terminated");
            return Self::refusal(
                &request,
                log,
                SecurityCheck::clean(),
                "This session has been terminated by security policy.",
            );
        }
        if (!request.src_ip.is_empty() && !self.state.check_rate_limit("ip", &request.src_ip))
            || (!request.user_id.is_empty()
                && !self.state.check_rate_limit("user", &request.user_id))
        {
            log.push("enforcement", "blocked", "rate limit exceeded");
            return Self::refusal(
                &request,
                log,
                SecurityCheck::clean(),
                "Rate limit exceeded. Slow down and try again later.",
            );
        }
        log.push("enforcement", "ok", "no standing restrictions");

        // Detection.
        let mut entry = LogEntry::new("chat", &request.message);
        entry.user_id = request.user_id.clone();
        entry.session_id = request.session_id.clone();
        entry.src_ip = request.src_ip.clone();
        entry
            .metadata
            .insert("environment".to_string(), request.environment.clone());
        entry
            .metadata
            .insert("security_mode".to_string(), request.security_mode.clone());

        let mut security_check = SecurityCheck::clean();
        let mut blocked = false;

        match self.builder.process(&entry).await {
            Some(alert) => {
                log.push(
                    "detection",
                    "alert",
                    format!("{} via {}", alert.threat_type.as_str(), alert.detection_method()),
                );
                security_check.threat_detected = true;
                security_check.severity = Some(alert.severity);
                security_check.threat_type = Some(alert.threat_type);
                security_check.detection_method = Some(alert.detection_method().to_string());

                let outcome = if request.auto_remediation {
                    self.analyst.handle(&alert).await
                } else {
                    self.analyst.decide(&alert)
                };
                match outcome {
                    Ok((decision, playbook)) => {
                        security_check.false_positive_probability = decision.fp_probability;
                        log.push(
                            "analysis",
                            decision.decision.as_str(),
                            format!(
                                "certainty {:.2}, fp {:.2}",
                                decision.certainty, decision.fp_probability
                            ),
                        );

                        if let Some(playbook) = playbook {
                            security_check.remediation_actions = playbook
                                .actions
                                .iter()
                                .map(|a| format!("{}:{}", a.kind, a.parameter))
                                .collect();
                            if request.auto_remediation {
                                log.push(
                                    "remediation",
                                    "queued",
                                    format!("playbook {} queued", playbook.id),
                                );
                            } else {
                                log.push(
                                    "remediation",
                                    "advisory",
                                    "auto-remediation disabled for this request",
                                );
                            }
                        }

                        blocked = decision.decision == DecisionKind::Alert;
                    }
                    Err(e) => {
                        warn!("[Gateway] analyst failed: {}", e);
                        log.push("analysis", "degraded", e.to_string());
                        // fail safe: a detected threat without analysis blocks
                        blocked = true;
                    }
                }
            }
            None => log.push("detection", "ok", "no threat indicators"),
        }

        if blocked {
            log.push("response", "refused", "security policy refusal returned");
            info!(
                "[Gateway] 🛑 blocked message from {} in session {}",
                request.user_id, request.session_id
            );
            return Self::refusal(
                &request,
                log,
                security_check,
                "I can't help with that request. This interaction has been logged for review.",
            );
        }

        // Clean (or false-positive) traffic flows to the model.
        let response = match self
            .llm
            .chat(&request.message, None, &request.security_mode)
            .await
        {
            Ok(reply) => {
                log.push(
                    "response",
                    "ok",
                    format!("model replied in {} ms", reply.latency_ms),
                );
                reply.text
            }
            Err(e) => {
                log.push("response", "degraded", format!("llm unavailable: {}", e));
                "The assistant is temporarily unavailable; your message was processed safely."
                    .to_string()
            }
        };

        ChatResponse {
            response,
            blocked: false,
            security_check,
            session_id: request.session_id,
            workflow_log: log.0,
        }
    }

    pub fn config(&self) -> &SocConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_deserialize() {
        let req: ChatRequest = serde_json::from_str(
            r#"{"message":"hi","user_id":"u-1","session_id":"s-1","src_ip":"198.51.100.4"}"#,
        )
        .unwrap();
        assert_eq!(req.environment, "production");
        assert_eq!(req.security_mode, "default");
        assert!(!req.auto_remediation);
    }
}
