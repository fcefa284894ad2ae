//! Analyst: alerts to decisions to playbooks
//!
//! Validates incoming alerts, computes weighted certainty and
//! false-positive scores, applies environment guards, synthesizes the
//! playbook and hands it to the remediation queue with backoff on
//! backpressure. A failed memory read degrades to neutral defaults rather
//! than stalling the pipeline.

use crate::audit::AuditChain;
use crate::core::bus::Subscription;
use crate::core::config::{DetectionConfig, RemediationConfig};
use crate::core::error::{SocError, SocResult};
use crate::core::queue::{EnqueueOutcome, RemediatorQueue};
use crate::core::types::{now_secs, Alert, Decision, DecisionKind, Severity};
use crate::memory::AgentMemory;
use crate::remediate::actions::Action;
use crate::remediate::playbook::Playbook;
use serde_json::{json, Map};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const W_PATTERN: f64 = 0.30;
const W_USER: f64 = 0.25;
const W_CONTEXT: f64 = 0.25;
const W_THREAT: f64 = 0.20;

const ENQUEUE_ATTEMPTS: u32 = 5;
const ENQUEUE_BASE_DELAY: Duration = Duration::from_millis(200);

const DEVELOPER_TERMS: &[&str] = &[
    "code", "python", "exception", "function", "debug", "error", "compile", "syntax",
];

/// Second pipeline stage.
pub struct Analyst {
    detection_cfg: DetectionConfig,
    remediation_cfg: RemediationConfig,
    memory: Arc<AgentMemory>,
    queue: Arc<RemediatorQueue<Playbook>>,
    chain: Arc<AuditChain>,
    malformed_count: AtomicU64,
}

impl Analyst {
    pub fn new(
        detection_cfg: DetectionConfig,
        remediation_cfg: RemediationConfig,
        memory: Arc<AgentMemory>,
        queue: Arc<RemediatorQueue<Playbook>>,
        chain: Arc<AuditChain>,
    ) -> Self {
        Analyst {
            detection_cfg,
            remediation_cfg,
            memory,
            queue,
            chain,
            malformed_count: AtomicU64::new(0),
        }
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed_count.load(Ordering::Relaxed)
    }

    fn environment_of(alert: &Alert) -> String {
        alert
            .evidence
            .get("environment")
            .and_then(|v| v.as_str())
            .unwrap_or("production")
            .to_string()
    }

    fn message_of(alert: &Alert) -> String {
        alert
            .evidence
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or(&alert.description)
            .to_lowercase()
    }

    fn severity_legitimacy(severity: Severity) -> f64 {
        match severity {
            Severity::Low => 0.3,
            Severity::Medium => 0.55,
            Severity::High => 0.8,
            Severity::Critical => 0.9,
        }
    }

    fn threat_specificity(alert: &Alert) -> f64 {
        let mut score: f64 = match alert.severity {
            Severity::Low => 0.2,
            Severity::Medium => 0.5,
            Severity::High => 0.8,
            Severity::Critical => 0.95,
        };
        // High-similarity semantic evidence sharpens the indicator.
        if let Some(similarity) = alert.evidence.get("similarity_score").and_then(|v| v.as_f64()) {
            if similarity >= 0.9 {
                score = score.max(0.9);
            }
        }
        if let Some(matches) = alert.evidence.get("pattern_matches").and_then(|v| v.as_array()) {
            if matches.len() > 1 {
                score = (score + 0.05).min(1.0);
            }
        }
        score
    }

    /// Weighted certainty and false-positive scoring per the analyst model.
    pub fn assess(&self, alert: &Alert) -> Decision {
        let mut reasoning = Vec::new();
        let mut degraded = false;
        let environment = Self::environment_of(alert);
        let message = Self::message_of(alert);

        // pattern_legitimacy: how trustworthy is the matching evidence
        let pattern_legitimacy = alert
            .evidence
            .get("similarity_score")
            .or_else(|| alert.evidence.get("llm_score"))
            .and_then(|v| v.as_f64())
            .unwrap_or_else(|| {
                if alert.evidence.contains_key("conversational_pattern") {
                    0.85
                } else {
                    Self::severity_legitimacy(alert.severity)
                }
            });
        reasoning.push(format!("pattern_legitimacy={:.2}", pattern_legitimacy));

        // user_behavior: historical false positives and recent activity
        let (fp_history, recent) = match (
            self.memory.fp_rate(&alert.user_id),
            self.memory.recent_alert_count(&alert.user_id, now_secs() - 3600),
        ) {
            (Ok(rate), Ok(recent)) => (rate, recent),
            _ => {
                degraded = true;
                reasoning.push("memory unavailable, neutral user profile".to_string());
                (None, 0)
            }
        };
        let mut user_behavior = match fp_history {
            // a clean slate is no excuse, a noisy FP history is
            Some(rate) => (1.0 - rate).clamp(0.0, 1.0),
            None => 0.9,
        };
        if recent >= 3 {
            user_behavior = (user_behavior + 0.1).min(1.0);
            reasoning.push(format!("{} alerts in the last hour", recent));
        }
        reasoning.push(format!("user_behavior={:.2}", user_behavior));

        // context_awareness: deployment environment criticality
        let context_awareness = match environment.as_str() {
            "medical" | "financial" => 1.0,
            "production" => 0.9,
            "development" | "dev" | "lab" => 0.6,
            _ => 0.7,
        };
        reasoning.push(format!("context[{}]={:.2}", environment, context_awareness));

        // threat_indicators: specificity of what matched
        let threat_indicators = Self::threat_specificity(alert);
        reasoning.push(format!("threat_indicators={:.2}", threat_indicators));

        let certainty = (W_PATTERN * pattern_legitimacy
            + W_USER * user_behavior
            + W_CONTEXT * context_awareness
            + W_THREAT * threat_indicators)
            .clamp(0.0, 1.0);

        // Symmetric false-positive model over the same component structure.
        let developer_context = DEVELOPER_TERMS
            .iter()
            .filter(|t| message.contains(*t))
            .count()
            >= 2;
        let fp_pattern = 1.0 - pattern_legitimacy;
        let fp_user = fp_history.unwrap_or(0.5);
        let fp_context = if developer_context {
            reasoning.push("developer-context phrasing".to_string());
            0.95
        } else if matches!(environment.as_str(), "development" | "dev" | "lab") {
            0.7
        } else {
            0.3
        };
        let fp_threat = 1.0 - threat_indicators;
        let fp_probability = (W_PATTERN * fp_pattern
            + W_USER * fp_user
            + W_CONTEXT * fp_context
            + W_THREAT * fp_threat)
            .clamp(0.0, 1.0);

        let decision = if certainty > self.detection_cfg.certainty_high {
            DecisionKind::Alert
        } else if fp_probability > self.detection_cfg.fp_high {
            DecisionKind::FalsePositive
        } else {
            DecisionKind::Investigate
        };

        let mut analyst_context = Map::new();
        analyst_context.insert("environment".into(), json!(environment));
        analyst_context.insert("recent_alerts".into(), json!(recent));
        analyst_context.insert("fp_history".into(), json!(fp_history));

        Decision {
            alert_id: alert.id.clone(),
            decision,
            certainty,
            fp_probability,
            reasoning,
            analyst_context,
            degraded,
        }
    }

    fn is_internal_context(alert: &Alert, environment: &str) -> bool {
        if matches!(environment, "development" | "dev" | "lab") {
            return true;
        }
        match alert.src_ip.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => v4.is_loopback() || v4.is_private(),
            Ok(IpAddr::V6(v6)) => v6.is_loopback(),
            Err(_) => false,
        }
    }

    /// Synthesize the remediation intent for a decided alert. False
    /// positives produce none.
    pub fn build_playbook(&self, alert: &Alert, decision: &Decision) -> SocResult<Option<Playbook>> {
        let environment = Self::environment_of(alert);
        let internal = Self::is_internal_context(alert, &environment);
        let regulated = matches!(environment.as_str(), "medical" | "financial");

        fn push(actions: &mut Vec<Action>, action: SocResult<Action>) {
            if let Ok(a) = action {
                actions.push(a);
            }
        }
        let mut actions: Vec<Action> = Vec::new();

        match decision.decision {
            DecisionKind::FalsePositive => return Ok(None),
            DecisionKind::Investigate => {
                if !alert.user_id.is_empty() {
                    push(&mut actions, Action::new("flag_user", &alert.user_id));
                }
                if !alert.session_id.is_empty() {
                    push(&mut actions, Action::new("enable_enhanced_monitoring", &alert.session_id));
                }
                if regulated {
                    push(&mut actions, Action::new(
                        "notify_compliance_team",
                        &format!("investigate alert {} in {}", alert.id, environment),
                    ));
                }
            }
            DecisionKind::Alert => {
                match alert.severity {
                    Severity::Low => {
                        let target = if alert.session_id.is_empty() {
                            alert.user_id.clone()
                        } else {
                            alert.session_id.clone()
                        };
                        push(&mut actions, Action::new("enable_enhanced_monitoring", &target));
                    }
                    Severity::Medium => {
                        if !alert.src_ip.is_empty() {
                            push(&mut actions, Action::new("rate_limit_ip", &alert.src_ip));
                        } else if !alert.user_id.is_empty() {
                            push(&mut actions, Action::new("rate_limit_user", &alert.user_id));
                        }
                    }
                    Severity::High => {
                        if !alert.src_ip.is_empty() {
                            push(&mut actions, Action::new("rate_limit_ip", &alert.src_ip));
                        } else if !alert.user_id.is_empty() {
                            push(&mut actions, Action::new("rate_limit_user", &alert.user_id));
                        }
                        if !alert.session_id.is_empty() {
                            push(&mut actions, Action::new("terminate_session", &alert.session_id));
                        }
                    }
                    Severity::Critical => {
                        if !alert.src_ip.is_empty() {
                            push(&mut actions, Action::new("block_ip", &alert.src_ip));
                        }
                        if !alert.session_id.is_empty() {
                            push(&mut actions, Action::new("terminate_session", &alert.session_id));
                        }
                        if !alert.user_id.is_empty() {
                            push(&mut actions, Action::new("suspend_user", &alert.user_id));
                        }
                    }
                }
                if regulated {
                    push(&mut actions, Action::new(
                        "notify_compliance_team",
                        &format!("{} alert {} in {}", alert.severity.as_str(), alert.id, environment),
                    ));
                }
            }
        }

        // Environment guard: internal traffic never gets destructive
        // remediation, regardless of certainty.
        if internal {
            let internal_ip = match alert.src_ip.parse::<IpAddr>() {
                Ok(IpAddr::V4(v4)) => v4.is_loopback() || v4.is_private(),
                Ok(IpAddr::V6(v6)) => v6.is_loopback(),
                Err(_) => false,
            };
            let before = actions.len();
            actions.retain(|a| {
                !matches!(
                    a.kind.as_str(),
                    "block_ip" | "suspend_user" | "terminate_session" | "isolate_agent"
                ) && !(a.kind == "rate_limit_ip" && internal_ip)
            });
            if actions.len() < before {
                if !alert.user_id.is_empty()
                    && !actions.iter().any(|a| a.kind == "flag_user")
                {
                    push(&mut actions, Action::new("flag_user", &alert.user_id));
                }
                if !alert.session_id.is_empty()
                    && !actions
                        .iter()
                        .any(|a| a.kind == "enable_enhanced_monitoring")
                {
                    push(&mut actions, Action::new("enable_enhanced_monitoring", &alert.session_id));
                }
            }
        }

        if actions.is_empty() {
            return Ok(None);
        }

        let mut playbook = Playbook::new(
            &alert.id,
            "soc_analyst",
            &format!(
                "{} ({}) certainty {:.2}",
                alert.threat_type.as_str(),
                alert.rule_id,
                decision.certainty
            ),
            actions,
        );
        playbook.environment = environment;
        Ok(Some(playbook))
    }

    /// Enqueue with exponential backoff on backpressure; past the retry
    /// budget the playbook is persisted as pending for the next idle
    /// consumer.
    pub async fn submit(&self, playbook: Playbook) -> SocResult<()> {
        let mut delay = ENQUEUE_BASE_DELAY;
        for attempt in 0..ENQUEUE_ATTEMPTS {
            match self.queue.enqueue(playbook.clone()) {
                EnqueueOutcome::Accepted => return Ok(()),
                EnqueueOutcome::Rejected => return Err(SocError::Shutdown),
                EnqueueOutcome::Backpressure => {
                    warn!(
                        "[Analyst] queue backpressure (attempt {}/{})",
                        attempt + 1,
                        ENQUEUE_ATTEMPTS
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        let json = serde_json::to_string(&playbook).unwrap_or_default();
        self.memory
            .store_playbook(&playbook.id, &playbook.alert_id, &json, "pending")?;
        warn!("[Analyst] parked {} as pending after sustained backpressure", playbook.id);
        Ok(())
    }

    /// Assess, persist the decision, feed back pattern stats and synthesize
    /// the playbook, without queueing it.
    pub fn decide(&self, alert: &Alert) -> SocResult<(Decision, Option<Playbook>)> {
        let decision = self.assess(alert);

        if let Err(e) = self.memory.store_alert_decision(&decision, &alert.user_id) {
            warn!("[Analyst] decision persist failed: {}", e);
        }
        self.chain.append(
            "alert.decided",
            "analyst",
            json!({
                "alert_id": alert.id,
                "decision": decision.decision.as_str(),
                "certainty": decision.certainty,
                "fp_probability": decision.fp_probability,
                "degraded": decision.degraded,
            }),
        );

        if decision.decision == DecisionKind::FalsePositive {
            // Confirmed false positive drags the pattern's confidence down.
            if let Some(pattern_id) = alert
                .evidence
                .get("matched_pattern_id")
                .and_then(|v| v.as_str())
            {
                let _ = self.memory.record_pattern_false_positive(pattern_id);
            }
            info!(
                "[Analyst] {} judged false positive (fp={:.2})",
                alert.id, decision.fp_probability
            );
            return Ok((decision, None));
        }

        let Some(playbook) = self.build_playbook(alert, &decision)? else {
            return Ok((decision, None));
        };
        info!(
            "[Analyst] {} -> playbook {} ({} actions)",
            alert.id,
            playbook.id,
            playbook.actions.len()
        );
        Ok((decision, Some(playbook)))
    }

    /// Full handling of one alert: decide, then hand the playbook to the
    /// remediation queue.
    pub async fn handle(&self, alert: &Alert) -> SocResult<(Decision, Option<Playbook>)> {
        let (decision, playbook) = self.decide(alert)?;
        if let Some(playbook) = &playbook {
            self.submit(playbook.clone()).await?;
        }
        Ok((decision, playbook))
    }

    /// Subscriber loop over `security.alerts`. Malformed alerts are logged
    /// and skipped, never forwarded.
    pub async fn run(&self, subscription: Subscription) {
        info!("[Analyst] subscribed to alert stream");
        while let Some(payload) = subscription.recv().await {
            let alert: Alert = match serde_json::from_value(payload) {
                Ok(alert) => alert,
                Err(e) => {
                    self.malformed_count.fetch_add(1, Ordering::Relaxed);
                    warn!("[Analyst] dropping malformed alert: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.handle(&alert).await {
                warn!("[Analyst] handling {} failed: {}", alert.id, e);
            }
        }
        info!("[Analyst] alert stream closed");
    }

    pub fn rate_limit_defaults(&self) -> (u32, u64) {
        (
            self.remediation_cfg.rate_limit_default,
            self.remediation_cfg.rate_limit_window_secs,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::identity::Identity;
    use crate::core::config::SocConfig;
    use crate::core::types::{generate_id, ThreatType};

    fn analyst() -> (Analyst, Arc<RemediatorQueue<Playbook>>) {
        let cfg = SocConfig::default();
        let queue = Arc::new(RemediatorQueue::new(cfg.remediation.queue_capacity));
        let memory = Arc::new(AgentMemory::in_memory().unwrap());
        let chain = Arc::new(AuditChain::new(Identity::generate("soc-runtime")));
        (
            Analyst::new(cfg.detection, cfg.remediation, memory, queue.clone(), chain),
            queue,
        )
    }

    fn alert(severity: Severity, environment: &str, evidence: Map<String, serde_json::Value>) -> Alert {
        let mut evidence = evidence;
        evidence.insert("environment".into(), json!(environment));
        Alert {
            id: generate_id("alert"),
            timestamp: now_secs(),
            severity,
            threat_type: ThreatType::PromptInjection,
            title: "test".to_string(),
            description: "test alert".to_string(),
            rule_id: "SEMANTIC".to_string(),
            evidence,
            agent_id: "agent-1".to_string(),
            user_id: "u-1".to_string(),
            session_id: "sess-1".to_string(),
            src_ip: "203.0.113.10".to_string(),
        }
    }

    #[test]
    fn strong_semantic_match_is_high_certainty() {
        let (analyst, _) = analyst();
        let mut evidence = Map::new();
        evidence.insert("similarity_score".into(), json!(1.0));
        evidence.insert("detection_method".into(), json!("semantic"));
        let decision = analyst.assess(&alert(Severity::High, "development", evidence));
        assert!(decision.certainty >= 0.85, "certainty {}", decision.certainty);
        assert_eq!(decision.decision, DecisionKind::Alert);
    }

    #[test]
    fn developer_question_is_false_positive() {
        let (analyst, _) = analyst();
        let mut evidence = Map::new();
        evidence.insert("pattern_matches".into(), json!(["ignore"]));
        evidence.insert(
            "message".into(),
            json!("How do I ignore specific exceptions in my Python code?"),
        );
        let decision = analyst.assess(&alert(Severity::Low, "production", evidence));
        assert!(decision.fp_probability > 0.7, "fp {}", decision.fp_probability);
        assert_eq!(decision.decision, DecisionKind::FalsePositive);
    }

    #[test]
    fn critical_alert_gets_full_containment() {
        let (analyst, _) = analyst();
        let mut evidence = Map::new();
        evidence.insert("pattern_matches".into(), json!(["all API keys"]));
        let a = alert(Severity::Critical, "production", evidence);
        let decision = analyst.assess(&a);
        assert_eq!(decision.decision, DecisionKind::Alert);

        let playbook = analyst.build_playbook(&a, &decision).unwrap().unwrap();
        let kinds: Vec<&str> = playbook.actions.iter().map(|a| a.kind.as_str()).collect();
        assert!(kinds.contains(&"block_ip"));
        assert!(kinds.contains(&"terminate_session"));
        assert!(kinds.contains(&"suspend_user"));
    }

    #[test]
    fn internal_context_downgrades_destructive_actions() {
        let (analyst, _) = analyst();
        let mut evidence = Map::new();
        evidence.insert("similarity_score".into(), json!(1.0));
        let mut a = alert(Severity::High, "development", evidence);
        a.src_ip = "127.0.0.1".to_string();

        let decision = analyst.assess(&a);
        assert_eq!(decision.decision, DecisionKind::Alert);
        let playbook = analyst.build_playbook(&a, &decision).unwrap().unwrap();
        let kinds: Vec<&str> = playbook.actions.iter().map(|a| a.kind.as_str()).collect();
        assert!(!kinds.contains(&"terminate_session"));
        assert!(!kinds.contains(&"block_ip"));
        assert!(kinds.contains(&"flag_user"));
        assert!(kinds.contains(&"enable_enhanced_monitoring"));
    }

    #[tokio::test]
    async fn handle_submits_playbook_to_queue() {
        let (analyst, queue) = analyst();
        let mut evidence = Map::new();
        evidence.insert("similarity_score".into(), json!(0.95));
        let a = alert(Severity::High, "production", evidence);

        let (decision, playbook) = analyst.handle(&a).await.unwrap();
        assert_eq!(decision.decision, DecisionKind::Alert);
        let playbook = playbook.unwrap();
        assert_eq!(queue.len(), 1);
        let queued = queue.dequeue().await.unwrap();
        assert_eq!(queued.id, playbook.id);
        assert_eq!(queued.alert_id, a.id);
    }

    #[tokio::test]
    async fn malformed_alert_is_counted_and_skipped() {
        let (analyst, _) = analyst();
        let bus = crate::core::bus::MessageBus::new(8, 100);
        let sub = bus.subscribe("security.alerts");
        bus.publish("security.alerts", json!({"not": "an alert"})).await;
        bus.close("security.alerts");
        analyst.run(sub).await;
        assert_eq!(analyst.malformed_count(), 1);
    }
}
