//! Agent memory: the embedded relational store
//!
//! Persistent home for patterns, decisions, playbooks, learning records and
//! remediation state mirrors. Every mutating operation runs inside a
//! transaction on a pooled connection; transient errors are retried with
//! exponential backoff before surfacing.

pub mod pool;

use crate::audit::AuditEntry;
use crate::core::config::MemoryConfig;
use crate::core::error::SocResult;
use crate::core::types::{generate_id, now_secs, Alert, Decision};
use pool::{with_retry, ConnectionPool};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Stored detector knowledge classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    RuleKeyword,
    SemanticExemplar,
    ConversationalSignature,
    LearnedVariation,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::RuleKeyword => "rule_keyword",
            PatternKind::SemanticExemplar => "semantic_exemplar",
            PatternKind::ConversationalSignature => "conversational_signature",
            PatternKind::LearnedVariation => "learned_variation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rule_keyword" => Some(PatternKind::RuleKeyword),
            "semantic_exemplar" => Some(PatternKind::SemanticExemplar),
            "conversational_signature" => Some(PatternKind::ConversationalSignature),
            "learned_variation" => Some(PatternKind::LearnedVariation),
            _ => None,
        }
    }
}

/// One row of detector knowledge.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub text: String,
    pub kind: PatternKind,
    pub threat_type: String,
    /// Effective confidence: `base * detections / (detections + fps + 1)`
    /// once feedback exists, otherwise the base value.
    pub confidence: f64,
    pub base_confidence: f64,
    pub detection_count: u32,
    pub false_positive_count: u32,
    pub source_attack_id: Option<String>,
    pub active: bool,
}

/// A reported detection miss awaiting the learning loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MissedAttack {
    pub id: String,
    pub message: String,
    pub threat_type: String,
    pub severity: String,
    pub reporter: String,
    pub metadata: serde_json::Value,
    pub processed: bool,
    pub created_at: i64,
}

/// A generated variant of a missed attack.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatternVariation {
    pub id: String,
    pub attack_id: String,
    pub method: String,
    pub text: String,
    pub confidence: f64,
    pub keywords: Vec<String>,
    pub active: bool,
}

/// Aggregate learning counters.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct LearningMetrics {
    pub total_missed: u64,
    pub patterns_learned: u64,
    pub variations_generated: u64,
    pub detection_improvement: f64,
    pub false_negative_rate: f64,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS patterns (
    id TEXT PRIMARY KEY,
    text TEXT NOT NULL,
    kind TEXT NOT NULL,
    threat_type TEXT NOT NULL,
    confidence REAL NOT NULL,
    base_confidence REAL NOT NULL,
    detection_count INTEGER NOT NULL DEFAULT 0,
    false_positive_count INTEGER NOT NULL DEFAULT 0,
    source_attack_id TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS alert_decisions (
    alert_id TEXT PRIMARY KEY,
    alert_json TEXT NOT NULL,
    user_id TEXT NOT NULL DEFAULT '',
    decision TEXT NOT NULL DEFAULT 'pending',
    certainty REAL,
    fp_probability REAL,
    reasoning_json TEXT,
    degraded INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS remediation_decisions (
    id TEXT PRIMARY KEY,
    playbook_id TEXT NOT NULL,
    alert_id TEXT NOT NULL DEFAULT '',
    action_kind TEXT NOT NULL,
    parameter TEXT NOT NULL,
    outcome TEXT NOT NULL,
    detail TEXT,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS playbooks (
    id TEXT PRIMARY KEY,
    alert_id TEXT NOT NULL,
    playbook_json TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS approvals (
    id TEXT PRIMARY KEY,
    playbook_id TEXT NOT NULL,
    approver TEXT NOT NULL,
    decision TEXT NOT NULL,
    reason TEXT,
    signature TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS audit_logs (
    id TEXT PRIMARY KEY,
    prev_hash TEXT NOT NULL,
    event_type TEXT NOT NULL,
    actor TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    signature TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL DEFAULT '',
    terminated INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS users (
    user_id TEXT PRIMARY KEY,
    flagged INTEGER NOT NULL DEFAULT 0,
    suspended INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS missed_attacks (
    id TEXT PRIMARY KEY,
    message TEXT NOT NULL,
    threat_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    reporter TEXT NOT NULL,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    processed INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS pattern_variations (
    id TEXT PRIMARY KEY,
    attack_id TEXT NOT NULL,
    method TEXT NOT NULL,
    text TEXT NOT NULL,
    confidence REAL NOT NULL,
    keywords_json TEXT NOT NULL DEFAULT '[]',
    active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS learning_metrics (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    total_missed INTEGER NOT NULL DEFAULT 0,
    patterns_learned INTEGER NOT NULL DEFAULT 0,
    variations_generated INTEGER NOT NULL DEFAULT 0,
    detection_improvement REAL NOT NULL DEFAULT 0,
    false_negative_rate REAL NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS learning_events (
    id TEXT PRIMARY KEY,
    attack_id TEXT NOT NULL,
    event TEXT NOT NULL,
    detail_json TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS blocks (
    ip TEXT PRIMARY KEY,
    reason TEXT NOT NULL,
    alert_id TEXT NOT NULL DEFAULT '',
    blocked_at INTEGER NOT NULL,
    duration_secs INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS rate_limits (
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    limit_count INTEGER NOT NULL,
    window_secs INTEGER NOT NULL,
    tokens REAL NOT NULL,
    updated_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    PRIMARY KEY (entity_type, entity_id)
);
CREATE TABLE IF NOT EXISTS executed_actions (
    fingerprint TEXT PRIMARY KEY,
    playbook_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
"#;

/// Persistent store for patterns, decisions and learning records.
pub struct AgentMemory {
    pool: ConnectionPool,
}

impl AgentMemory {
    pub fn new(cfg: &MemoryConfig) -> SocResult<Self> {
        let pool = ConnectionPool::new(
            &cfg.db_path,
            cfg.connection_pool_size,
            Duration::from_millis(cfg.db_timeout_ms),
        )?;
        let memory = AgentMemory { pool };
        memory.init_schema()?;
        info!("[Memory] ready at {}", cfg.db_path);
        Ok(memory)
    }

    /// Shared in-memory database, one per call. Used by tests.
    pub fn in_memory() -> SocResult<Self> {
        let cfg = MemoryConfig {
            db_path: format!("file:{}?mode=memory&cache=shared", generate_id("memdb")),
            connection_pool_size: 2,
            db_timeout_ms: 2_000,
            sweep_interval_secs: 60,
        };
        Self::new(&cfg)
    }

    fn init_schema(&self) -> SocResult<()> {
        let conn = self.pool.checkout()?;
        with_retry(|| conn.execute_batch(SCHEMA))
    }

    pub fn temp_connection_count(&self) -> u64 {
        self.pool.temp_connection_count()
    }

    // ------------------------------------------------------------------
    // Patterns

    pub fn store_pattern(&self, pattern: &Pattern) -> SocResult<()> {
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO patterns
                 (id, text, kind, threat_type, confidence, base_confidence,
                  detection_count, false_positive_count, source_attack_id, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                   confidence = excluded.confidence,
                   active = excluded.active",
                params![
                    pattern.id,
                    pattern.text,
                    pattern.kind.as_str(),
                    pattern.threat_type,
                    pattern.confidence,
                    pattern.base_confidence,
                    pattern.detection_count,
                    pattern.false_positive_count,
                    pattern.source_attack_id,
                    pattern.active as i64,
                    now_secs(),
                ],
            )?;
            tx.commit()
        })
    }

    pub fn get_patterns(&self, kind: PatternKind) -> SocResult<Vec<Pattern>> {
        let conn = self.pool.checkout()?;
        with_retry(|| {
            let mut stmt = conn.prepare(
                "SELECT id, text, kind, threat_type, confidence, base_confidence,
                        detection_count, false_positive_count, source_attack_id, active
                 FROM patterns WHERE kind = ?1 AND active = 1",
            )?;
            let rows = stmt.query_map(params![kind.as_str()], |row| {
                Ok(Pattern {
                    id: row.get(0)?,
                    text: row.get(1)?,
                    kind: PatternKind::parse(&row.get::<_, String>(2)?)
                        .unwrap_or(PatternKind::RuleKeyword),
                    threat_type: row.get(3)?,
                    confidence: row.get(4)?,
                    base_confidence: row.get(5)?,
                    detection_count: row.get(6)?,
                    false_positive_count: row.get(7)?,
                    source_attack_id: row.get(8)?,
                    active: row.get::<_, i64>(9)? != 0,
                })
            })?;
            rows.collect()
        })
    }

    pub fn update_pattern_confidence(&self, id: &str, delta: f64) -> SocResult<()> {
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE patterns
                 SET confidence = MAX(0.0, MIN(1.0, confidence + ?2))
                 WHERE id = ?1",
                params![id, delta],
            )?;
            tx.commit()
        })
    }

    /// Successful detection: bump the counter, recompute effective confidence.
    pub fn record_pattern_detection(&self, id: &str) -> SocResult<()> {
        self.apply_pattern_feedback(id, true)
    }

    /// Confirmed false positive: bump the counter, recompute downward.
    pub fn record_pattern_false_positive(&self, id: &str) -> SocResult<()> {
        self.apply_pattern_feedback(id, false)
    }

    fn apply_pattern_feedback(&self, id: &str, detection: bool) -> SocResult<()> {
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            // Built-in rule ids get a stub row on first feedback so their
            // counters track alongside learned patterns.
            tx.execute(
                "INSERT OR IGNORE INTO patterns
                 (id, text, kind, threat_type, confidence, base_confidence,
                  detection_count, false_positive_count, active, created_at)
                 VALUES (?1, '', 'rule_keyword', 'suspicious_behavior', 0.8, 0.8, 0, 0, 1, ?2)",
                params![id, now_secs()],
            )?;
            let column = if detection {
                "detection_count"
            } else {
                "false_positive_count"
            };
            tx.execute(
                &format!("UPDATE patterns SET {} = {} + 1 WHERE id = ?1", column, column),
                params![id],
            )?;
            // effective = base * detections / (detections + fps + 1)
            tx.execute(
                "UPDATE patterns
                 SET confidence = base_confidence *
                     (CAST(detection_count AS REAL) /
                      (detection_count + false_positive_count + 1))
                 WHERE id = ?1 AND (detection_count + false_positive_count) > 0",
                params![id],
            )?;
            tx.commit()
        })
    }

    pub fn get_pattern(&self, id: &str) -> SocResult<Option<Pattern>> {
        let conn = self.pool.checkout()?;
        with_retry(|| {
            conn.query_row(
                "SELECT id, text, kind, threat_type, confidence, base_confidence,
                        detection_count, false_positive_count, source_attack_id, active
                 FROM patterns WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Pattern {
                        id: row.get(0)?,
                        text: row.get(1)?,
                        kind: PatternKind::parse(&row.get::<_, String>(2)?)
                            .unwrap_or(PatternKind::RuleKeyword),
                        threat_type: row.get(3)?,
                        confidence: row.get(4)?,
                        base_confidence: row.get(5)?,
                        detection_count: row.get(6)?,
                        false_positive_count: row.get(7)?,
                        source_attack_id: row.get(8)?,
                        active: row.get::<_, i64>(9)? != 0,
                    })
                },
            )
            .optional()
        })
    }

    // ------------------------------------------------------------------
    // Alerts & decisions

    /// The alert row and its decision arrive independently (the Builder
    /// persists through an async outbox), so both writes are upserts.
    pub fn store_alert(&self, alert: &Alert) -> SocResult<()> {
        let alert_json = serde_json::to_string(alert).unwrap_or_default();
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO alert_decisions (alert_id, alert_json, user_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(alert_id) DO UPDATE SET
                   alert_json = excluded.alert_json,
                   user_id = excluded.user_id",
                params![alert.id, alert_json, alert.user_id, now_secs()],
            )?;
            tx.commit()
        })
    }

    pub fn store_alert_decision(&self, decision: &Decision, user_id: &str) -> SocResult<()> {
        let reasoning = serde_json::to_string(&decision.reasoning).unwrap_or_default();
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO alert_decisions
                 (alert_id, alert_json, user_id, decision, certainty, fp_probability,
                  reasoning_json, degraded, created_at)
                 VALUES (?1, '{}', ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(alert_id) DO UPDATE SET
                   decision = excluded.decision,
                   certainty = excluded.certainty,
                   fp_probability = excluded.fp_probability,
                   reasoning_json = excluded.reasoning_json,
                   degraded = excluded.degraded",
                params![
                    decision.alert_id,
                    user_id,
                    decision.decision.as_str(),
                    decision.certainty,
                    decision.fp_probability,
                    reasoning,
                    decision.degraded as i64,
                    now_secs(),
                ],
            )?;
            tx.commit()
        })
    }

    /// Historical false-positive rate for a user; `None` without any
    /// decided history.
    pub fn fp_rate(&self, user_id: &str) -> SocResult<Option<f64>> {
        let conn = self.pool.checkout()?;
        with_retry(|| {
            let (total, fps): (i64, i64) = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN decision = 'false_positive' THEN 1 ELSE 0 END), 0)
                 FROM alert_decisions
                 WHERE user_id = ?1 AND decision != 'pending'",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(if total == 0 {
                None
            } else {
                Some(fps as f64 / total as f64)
            })
        })
    }

    pub fn recent_alert_count(&self, user_id: &str, since: i64) -> SocResult<u32> {
        let conn = self.pool.checkout()?;
        with_retry(|| {
            conn.query_row(
                "SELECT COUNT(*) FROM alert_decisions WHERE user_id = ?1 AND created_at >= ?2",
                params![user_id, since],
                |row| row.get::<_, i64>(0).map(|n| n as u32),
            )
        })
    }

    // ------------------------------------------------------------------
    // Playbooks, approvals, remediation

    pub fn store_playbook(&self, id: &str, alert_id: &str, json: &str, status: &str) -> SocResult<()> {
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO playbooks (id, alert_id, playbook_json, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                   playbook_json = excluded.playbook_json,
                   status = excluded.status,
                   updated_at = excluded.updated_at",
                params![id, alert_id, json, status, now_secs()],
            )?;
            tx.commit()
        })
    }

    pub fn update_playbook_status(&self, id: &str, status: &str) -> SocResult<()> {
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE playbooks SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status, now_secs()],
            )?;
            tx.commit()
        })
    }

    pub fn list_playbooks_with_status(&self, status: &str) -> SocResult<Vec<String>> {
        let conn = self.pool.checkout()?;
        with_retry(|| {
            let mut stmt =
                conn.prepare("SELECT playbook_json FROM playbooks WHERE status = ?1")?;
            let rows = stmt.query_map(params![status], |row| row.get(0))?;
            rows.collect()
        })
    }

    pub fn store_approval(
        &self,
        playbook_id: &str,
        approver: &str,
        decision: &str,
        reason: Option<&str>,
        signature: &str,
    ) -> SocResult<()> {
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO approvals (id, playbook_id, approver, decision, reason, signature, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    generate_id("appr"),
                    playbook_id,
                    approver,
                    decision,
                    reason,
                    signature,
                    now_secs()
                ],
            )?;
            tx.commit()
        })
    }

    pub fn store_remediation_decision(
        &self,
        playbook_id: &str,
        alert_id: &str,
        action_kind: &str,
        parameter: &str,
        outcome: &str,
        detail: Option<&str>,
    ) -> SocResult<()> {
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO remediation_decisions
                 (id, playbook_id, alert_id, action_kind, parameter, outcome, detail, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    generate_id("rd"),
                    playbook_id,
                    alert_id,
                    action_kind,
                    parameter,
                    outcome,
                    detail,
                    now_secs()
                ],
            )?;
            tx.commit()
        })
    }

    pub fn store_audit_entry(&self, entry: &AuditEntry) -> SocResult<()> {
        let payload = entry.payload.to_string();
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO audit_logs
                 (id, prev_hash, event_type, actor, payload_json, signature, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.id,
                    entry.prev_hash,
                    entry.event_type,
                    entry.actor,
                    payload,
                    entry.signature,
                    entry.timestamp
                ],
            )?;
            tx.commit()
        })
    }

    // ------------------------------------------------------------------
    // Remediation state mirror

    pub fn upsert_block(
        &self,
        ip: &str,
        reason: &str,
        alert_id: &str,
        blocked_at: i64,
        duration_secs: u64,
    ) -> SocResult<()> {
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO blocks (ip, reason, alert_id, blocked_at, duration_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(ip) DO UPDATE SET
                   reason = excluded.reason,
                   alert_id = excluded.alert_id,
                   blocked_at = excluded.blocked_at,
                   duration_secs = excluded.duration_secs",
                params![ip, reason, alert_id, blocked_at, duration_secs as i64],
            )?;
            tx.commit()
        })
    }

    pub fn remove_block(&self, ip: &str) -> SocResult<()> {
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM blocks WHERE ip = ?1", params![ip])?;
            tx.commit()
        })
    }

    pub fn list_blocks_expiring_before(&self, t: i64) -> SocResult<Vec<String>> {
        let conn = self.pool.checkout()?;
        with_retry(|| {
            let mut stmt =
                conn.prepare("SELECT ip FROM blocks WHERE blocked_at + duration_secs <= ?1")?;
            let rows = stmt.query_map(params![t], |row| row.get(0))?;
            rows.collect()
        })
    }

    pub fn upsert_rate_limit(
        &self,
        entity_type: &str,
        entity_id: &str,
        limit: u32,
        window_secs: u64,
        tokens: f64,
        expires_at: i64,
    ) -> SocResult<()> {
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO rate_limits
                 (entity_type, entity_id, limit_count, window_secs, tokens, updated_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                   limit_count = excluded.limit_count,
                   window_secs = excluded.window_secs,
                   tokens = excluded.tokens,
                   updated_at = excluded.updated_at,
                   expires_at = excluded.expires_at",
                params![
                    entity_type,
                    entity_id,
                    limit,
                    window_secs as i64,
                    tokens,
                    now_secs(),
                    expires_at
                ],
            )?;
            tx.commit()
        })
    }

    pub fn mark_session_terminated(&self, session_id: &str) -> SocResult<()> {
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO sessions (session_id, terminated, created_at) VALUES (?1, 1, ?2)
                 ON CONFLICT(session_id) DO UPDATE SET terminated = 1",
                params![session_id, now_secs()],
            )?;
            tx.commit()
        })
    }

    pub fn mark_user(&self, user_id: &str, flagged: bool, suspended: bool) -> SocResult<()> {
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO users (user_id, flagged, suspended, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                   flagged = MAX(users.flagged, excluded.flagged),
                   suspended = MAX(users.suspended, excluded.suspended)",
                params![user_id, flagged as i64, suspended as i64, now_secs()],
            )?;
            tx.commit()
        })
    }

    /// Remove expired blocks and rate limits. Returns (blocks, limits) purged.
    pub fn purge_expired(&self, now: i64) -> SocResult<(usize, usize)> {
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            let blocks = tx.execute(
                "DELETE FROM blocks WHERE blocked_at + duration_secs <= ?1",
                params![now],
            )?;
            let limits = tx.execute("DELETE FROM rate_limits WHERE expires_at <= ?1", params![now])?;
            tx.commit()?;
            Ok((blocks, limits))
        })
        .map(|(b, l)| {
            if b + l > 0 {
                debug!("[Memory] sweeper purged {} blocks, {} rate limits", b, l);
            }
            (b, l)
        })
    }

    // ------------------------------------------------------------------
    // Idempotency

    pub fn was_executed(&self, fingerprint: &str) -> SocResult<bool> {
        let conn = self.pool.checkout()?;
        with_retry(|| {
            conn.query_row(
                "SELECT 1 FROM executed_actions WHERE fingerprint = ?1",
                params![fingerprint],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
        })
    }

    pub fn record_execution(&self, fingerprint: &str, playbook_id: &str) -> SocResult<()> {
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO executed_actions (fingerprint, playbook_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![fingerprint, playbook_id, now_secs()],
            )?;
            tx.commit()
        })
    }

    // ------------------------------------------------------------------
    // Learning

    pub fn report_missed_attack(
        &self,
        message: &str,
        threat_type: &str,
        severity: &str,
        reporter: &str,
        metadata: &serde_json::Value,
    ) -> SocResult<String> {
        let id = generate_id("miss");
        let metadata_json = metadata.to_string();
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO missed_attacks
                 (id, message, threat_type, severity, reporter, metadata_json, processed, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
                params![id, message, threat_type, severity, reporter, metadata_json, now_secs()],
            )?;
            tx.commit()
        })?;
        Ok(id)
    }

    pub fn list_unprocessed_misses(&self) -> SocResult<Vec<MissedAttack>> {
        let conn = self.pool.checkout()?;
        with_retry(|| {
            let mut stmt = conn.prepare(
                "SELECT id, message, threat_type, severity, reporter, metadata_json, processed, created_at
                 FROM missed_attacks WHERE processed = 0 ORDER BY created_at",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(MissedAttack {
                    id: row.get(0)?,
                    message: row.get(1)?,
                    threat_type: row.get(2)?,
                    severity: row.get(3)?,
                    reporter: row.get(4)?,
                    metadata: serde_json::from_str(&row.get::<_, String>(5)?)
                        .unwrap_or(serde_json::Value::Null),
                    processed: row.get::<_, i64>(6)? != 0,
                    created_at: row.get(7)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn get_missed_attack(&self, attack_id: &str) -> SocResult<Option<MissedAttack>> {
        let conn = self.pool.checkout()?;
        with_retry(|| {
            conn.query_row(
                "SELECT id, message, threat_type, severity, reporter, metadata_json, processed, created_at
                 FROM missed_attacks WHERE id = ?1",
                params![attack_id],
                |row| {
                    Ok(MissedAttack {
                        id: row.get(0)?,
                        message: row.get(1)?,
                        threat_type: row.get(2)?,
                        severity: row.get(3)?,
                        reporter: row.get(4)?,
                        metadata: serde_json::from_str(&row.get::<_, String>(5)?)
                            .unwrap_or(serde_json::Value::Null),
                        processed: row.get::<_, i64>(6)? != 0,
                        created_at: row.get(7)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn is_miss_processed(&self, attack_id: &str) -> SocResult<bool> {
        let conn = self.pool.checkout()?;
        with_retry(|| {
            conn.query_row(
                "SELECT processed FROM missed_attacks WHERE id = ?1",
                params![attack_id],
                |row| row.get::<_, i64>(0).map(|p| p != 0),
            )
            .optional()
            .map(|p| p.unwrap_or(false))
        })
    }

    pub fn mark_miss_processed(&self, attack_id: &str) -> SocResult<()> {
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE missed_attacks SET processed = 1 WHERE id = ?1",
                params![attack_id],
            )?;
            tx.commit()
        })
    }

    pub fn store_variation(&self, variation: &PatternVariation) -> SocResult<()> {
        let keywords = serde_json::to_string(&variation.keywords).unwrap_or_default();
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO pattern_variations
                 (id, attack_id, method, text, confidence, keywords_json, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    variation.id,
                    variation.attack_id,
                    variation.method,
                    variation.text,
                    variation.confidence,
                    keywords,
                    variation.active as i64,
                    now_secs()
                ],
            )?;
            tx.commit()
        })
    }

    pub fn list_active_variations(&self) -> SocResult<Vec<PatternVariation>> {
        let conn = self.pool.checkout()?;
        with_retry(|| {
            let mut stmt = conn.prepare(
                "SELECT id, attack_id, method, text, confidence, keywords_json, active
                 FROM pattern_variations WHERE active = 1 ORDER BY created_at",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(PatternVariation {
                    id: row.get(0)?,
                    attack_id: row.get(1)?,
                    method: row.get(2)?,
                    text: row.get(3)?,
                    confidence: row.get(4)?,
                    keywords: serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
                    active: row.get::<_, i64>(6)? != 0,
                })
            })?;
            rows.collect()
        })
    }

    pub fn record_learning_event(
        &self,
        attack_id: &str,
        event: &str,
        detail: &serde_json::Value,
    ) -> SocResult<()> {
        let detail_json = detail.to_string();
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO learning_events (id, attack_id, event, detail_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![generate_id("lev"), attack_id, event, detail_json, now_secs()],
            )?;
            tx.commit()
        })
    }

    pub fn learning_metrics(&self) -> SocResult<LearningMetrics> {
        let conn = self.pool.checkout()?;
        with_retry(|| {
            conn.query_row(
                "SELECT total_missed, patterns_learned, variations_generated,
                        detection_improvement, false_negative_rate
                 FROM learning_metrics WHERE id = 1",
                [],
                |row| {
                    Ok(LearningMetrics {
                        total_missed: row.get::<_, i64>(0)? as u64,
                        patterns_learned: row.get::<_, i64>(1)? as u64,
                        variations_generated: row.get::<_, i64>(2)? as u64,
                        detection_improvement: row.get(3)?,
                        false_negative_rate: row.get(4)?,
                    })
                },
            )
            .optional()
            .map(|m| m.unwrap_or_default())
        })
    }

    /// Fold a processed miss into the aggregate counters and recompute the
    /// derived rates.
    pub fn record_learning_outcome(
        &self,
        missed_delta: u64,
        learned_delta: u64,
        variations_delta: u64,
    ) -> SocResult<LearningMetrics> {
        let mut conn = self.pool.checkout()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO learning_metrics (id, total_missed, patterns_learned,
                                               variations_generated, updated_at)
                 VALUES (1, ?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                   total_missed = learning_metrics.total_missed + excluded.total_missed,
                   patterns_learned = learning_metrics.patterns_learned + excluded.patterns_learned,
                   variations_generated = learning_metrics.variations_generated
                       + excluded.variations_generated,
                   updated_at = excluded.updated_at",
                params![
                    missed_delta as i64,
                    learned_delta as i64,
                    variations_delta as i64,
                    now_secs()
                ],
            )?;
            tx.execute(
                "UPDATE learning_metrics SET
                   detection_improvement = CAST(patterns_learned AS REAL) / MAX(1, total_missed),
                   false_negative_rate =
                       CAST(MAX(0, total_missed - patterns_learned) AS REAL) / MAX(1, total_missed)
                 WHERE id = 1",
                [],
            )?;
            tx.commit()?;
            conn.query_row(
                "SELECT total_missed, patterns_learned, variations_generated,
                        detection_improvement, false_negative_rate
                 FROM learning_metrics WHERE id = 1",
                [],
                |row| {
                    Ok(LearningMetrics {
                        total_missed: row.get::<_, i64>(0)? as u64,
                        patterns_learned: row.get::<_, i64>(1)? as u64,
                        variations_generated: row.get::<_, i64>(2)? as u64,
                        detection_improvement: row.get(3)?,
                        false_negative_rate: row.get(4)?,
                    })
                },
            )
        })
    }
}
