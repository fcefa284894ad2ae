//! Multi-turn conversational pattern detector
//!
//! Keeps a sliding window of recent turns per session and looks for staged
//! attack shapes that no single message reveals. Windows are strictly
//! session-isolated and every pattern needs at least three matching turns,
//! so an isolated message can never read as a multi-turn attack.

use crate::core::types::{
    generate_id, normalize_message, now_secs, Alert, LogEntry, Severity, ThreatType,
};
use dashmap::DashMap;
use serde_json::{json, Map};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

struct Turn {
    normalized: String,
    timestamp: i64,
}

struct SessionWindow {
    turns: VecDeque<Turn>,
    last_seen: i64,
    fired: HashSet<&'static str>,
}

struct Stage {
    keywords: &'static [&'static str],
}

impl Stage {
    fn matches(&self, turn: &Turn) -> bool {
        self.keywords.iter().any(|k| turn.normalized.contains(k))
    }
}

struct ConversationPattern {
    name: &'static str,
    threat_type: ThreatType,
    severity: Severity,
    /// Ordered stages; each must be satisfied by a distinct later turn.
    stages: &'static [Stage],
    min_turns: usize,
}

const PATTERNS: &[ConversationPattern] = &[
    ConversationPattern {
        name: "progressive_probing",
        threat_type: ThreatType::PromptInjection,
        severity: Severity::High,
        stages: &[
            Stage { keywords: &["what can you do", "your capabilities", "what are you able", "what tools"] },
            Stage { keywords: &["restriction", "limitation", "not allowed", "your rules", "forbidden"] },
            Stage { keywords: &["bypass", "get around", "ignore them", "ignore the", "override", "work around"] },
        ],
        min_turns: 3,
    },
    ConversationPattern {
        name: "trust_building",
        threat_type: ThreatType::SuspiciousBehavior,
        severity: Severity::High,
        stages: &[
            Stage { keywords: &["thank", "great job", "so helpful", "awesome", "love talking"] },
            Stage { keywords: &["by the way", "quick question", "one more thing", "random question"] },
            Stage { keywords: &["password", "admin", "system prompt", "credential", "secret", "privileged"] },
        ],
        min_turns: 3,
    },
    ConversationPattern {
        name: "permission_escalation",
        threat_type: ThreatType::SuspiciousBehavior,
        severity: Severity::High,
        stages: &[
            Stage { keywords: &["can i have access", "could i get", "give me access", "read access"] },
            Stage { keywords: &["more access", "elevated", "higher privileges", "write access", "admin access"] },
            Stage { keywords: &["full access", "root", "all permissions", "superuser", "unrestricted"] },
        ],
        min_turns: 3,
    },
    ConversationPattern {
        name: "context_switching",
        threat_type: ThreatType::PromptInjection,
        severity: Severity::High,
        stages: &[
            Stage { keywords: &["new conversation", "start over", "reset", "forget what", "clean slate"] },
            Stage { keywords: &["you are now", "act as", "pretend to be", "your new role", "from now on you"] },
            Stage { keywords: &["ignore", "override", "no longer apply", "without restrictions"] },
        ],
        min_turns: 3,
    },
    ConversationPattern {
        name: "information_extraction",
        threat_type: ThreatType::SuspiciousBehavior,
        severity: Severity::Medium,
        stages: &[
            Stage { keywords: &["what model", "which version", "how were you", "who made you", "what is your"] },
            Stage { keywords: &["internal", "backend", "infrastructure", "architecture", "where is", "configuration"] },
            Stage { keywords: &["system prompt", "training data", "api", "database", "source code"] },
        ],
        min_turns: 3,
    },
];

/// Session-windowed detector for staged multi-turn attacks.
pub struct ConversationalDetector {
    sessions: DashMap<String, SessionWindow>,
    window: usize,
    timeout_secs: i64,
}

impl ConversationalDetector {
    pub fn new(window: usize, timeout_secs: u64) -> Self {
        info!(
            "[Conversational] tracking {} patterns (window {}, timeout {}s)",
            PATTERNS.len(),
            window,
            timeout_secs
        );
        ConversationalDetector {
            sessions: DashMap::new(),
            window,
            timeout_secs: timeout_secs as i64,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop session windows idle past the timeout. Called by the sweeper.
    pub fn evict_idle(&self) -> usize {
        let cutoff = now_secs() - self.timeout_secs;
        let before = self.sessions.len();
        self.sessions.retain(|_, w| w.last_seen >= cutoff);
        let evicted = before - self.sessions.len();
        if evicted > 0 {
            debug!("[Conversational] evicted {} idle sessions", evicted);
        }
        evicted
    }

    pub fn analyze(&self, log: &LogEntry) -> Option<Alert> {
        if log.session_id.is_empty() {
            return None;
        }
        let now = now_secs();

        let mut window = self
            .sessions
            .entry(log.session_id.clone())
            .or_insert_with(|| SessionWindow {
                turns: VecDeque::new(),
                last_seen: now,
                fired: HashSet::new(),
            });

        // A long gap resets the window: stale turns must not chain with
        // fresh ones.
        if now - window.last_seen > self.timeout_secs {
            window.turns.clear();
            window.fired.clear();
        }
        window.last_seen = now;

        window.turns.push_back(Turn {
            normalized: normalize_message(&log.message),
            timestamp: log.timestamp,
        });
        while window.turns.len() > self.window {
            window.turns.pop_front();
        }

        for pattern in PATTERNS {
            if window.fired.contains(pattern.name) {
                continue;
            }
            if window.turns.len() < pattern.min_turns {
                continue;
            }
            if let Some(sequence) = match_stages(pattern, &window.turns) {
                window.fired.insert(pattern.name);
                let turn_messages: Vec<String> = sequence
                    .iter()
                    .map(|&i| window.turns[i].normalized.clone())
                    .collect();
                let turn_timestamps: Vec<i64> =
                    sequence.iter().map(|&i| window.turns[i].timestamp).collect();

                let mut evidence = Map::new();
                evidence.insert("detection_method".into(), json!("conversational"));
                evidence.insert("conversational_pattern".into(), json!(pattern.name));
                evidence.insert("pattern".into(), json!(pattern.name));
                evidence.insert("turn_sequence".into(), json!(turn_messages));
                evidence.insert("turn_timestamps".into(), json!(turn_timestamps));
                evidence.insert("session_id".into(), json!(log.session_id));

                return Some(Alert {
                    id: generate_id("alert"),
                    timestamp: now,
                    severity: pattern.severity,
                    threat_type: pattern.threat_type,
                    title: format!("Multi-turn pattern: {}", pattern.name),
                    description: format!(
                        "session {} matched {} across {} turns",
                        log.session_id,
                        pattern.name,
                        sequence.len()
                    ),
                    rule_id: format!("CONV_{}", pattern.name.to_uppercase()),
                    evidence,
                    agent_id: log.agent_id.clone(),
                    user_id: log.user_id.clone(),
                    session_id: log.session_id.clone(),
                    src_ip: log.src_ip.clone(),
                });
            }
        }
        None
    }
}

/// Greedy in-order stage matching: each stage must be satisfied by a turn
/// strictly after the previous stage's turn. Returns the matched turn
/// indices when every stage is covered.
fn match_stages(pattern: &ConversationPattern, turns: &VecDeque<Turn>) -> Option<Vec<usize>> {
    let mut sequence = Vec::with_capacity(pattern.stages.len());
    let mut from = 0usize;
    for stage in pattern.stages {
        let found = (from..turns.len()).find(|&i| stage.matches(&turns[i]))?;
        sequence.push(found);
        from = found + 1;
    }
    if sequence.len() >= pattern.min_turns.min(pattern.stages.len()) {
        Some(sequence)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(session: &str, message: &str) -> LogEntry {
        let mut entry = LogEntry::new("chat", message);
        entry.session_id = session.to_string();
        entry.user_id = "u-1".to_string();
        entry
    }

    #[test]
    fn progressive_probing_fires_on_final_turn() {
        let d = ConversationalDetector::new(20, 1800);
        assert!(d.analyze(&log("s-1", "what can you do?")).is_none());
        assert!(d.analyze(&log("s-1", "what are your restrictions?")).is_none());
        let alert = d.analyze(&log("s-1", "how do I bypass them?"));
        let alert = match alert {
            Some(a) => a,
            None => d.analyze(&log("s-1", "now ignore them")).expect("pattern should fire"),
        };
        assert_eq!(alert.evidence["pattern"], "progressive_probing");
        assert_eq!(alert.severity, Severity::High);
        assert_eq!(alert.threat_type, ThreatType::PromptInjection);
        assert!(alert.evidence["turn_sequence"].as_array().unwrap().len() >= 3);
    }

    #[test]
    fn sessions_are_isolated() {
        let d = ConversationalDetector::new(20, 1800);
        assert!(d.analyze(&log("s-a", "what can you do?")).is_none());
        assert!(d.analyze(&log("s-b", "what are your restrictions?")).is_none());
        // the final stage in a third session must not complete the pattern
        assert!(d.analyze(&log("s-c", "how do I bypass them?")).is_none());
    }

    #[test]
    fn single_turn_never_fires() {
        let d = ConversationalDetector::new(20, 1800);
        let alert = d.analyze(&log(
            "s-x",
            "what can you do about restrictions i want to bypass",
        ));
        assert!(alert.is_none());
    }

    #[test]
    fn pattern_fires_once_per_session() {
        let d = ConversationalDetector::new(20, 1800);
        d.analyze(&log("s-1", "what can you do?"));
        d.analyze(&log("s-1", "any restrictions?"));
        assert!(d.analyze(&log("s-1", "how to bypass them?")).is_some());
        assert!(d.analyze(&log("s-1", "please bypass them")).is_none());
    }

    #[test]
    fn idle_sessions_are_evicted() {
        let d = ConversationalDetector::new(20, 0);
        d.analyze(&log("s-1", "hello"));
        assert_eq!(d.session_count(), 1);
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert_eq!(d.evict_idle(), 1);
        assert_eq!(d.session_count(), 0);
    }
}
