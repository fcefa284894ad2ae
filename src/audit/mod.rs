//! Append-only, cryptographically signed audit chain
//!
//! Every entry carries the hash of its predecessor and an ed25519 signature
//! from the runtime identity. `verify` walks the chain and reports the first
//! broken link; a broken chain seals the runtime against new approvals until
//! an operator acknowledges.

pub mod identity;

use crate::core::error::{SocError, SocResult};
use crate::core::types::{generate_id, now_secs};
use identity::{verify_signature, Identity};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One signed, hash-chained audit record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub prev_hash: String,
    pub event_type: String,
    pub actor: String,
    pub payload: Value,
    pub signature: String,
    pub timestamp: i64,
}

impl AuditEntry {
    /// Bytes covered by the signature.
    fn signed_bytes(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.id, self.prev_hash, self.event_type, self.actor, self.payload, self.timestamp
        )
        .into_bytes()
    }

    /// Link hash over the full entry, signature included.
    fn entry_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.signed_bytes());
        hasher.update(self.signature.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Thread-safe signed audit log.
pub struct AuditChain {
    entries: RwLock<Vec<AuditEntry>>,
    identity: Identity,
    sealed: AtomicBool,
}

impl AuditChain {
    pub fn new(identity: Identity) -> Self {
        AuditChain {
            entries: RwLock::new(Vec::new()),
            identity,
            sealed: AtomicBool::new(false),
        }
    }

    /// Append a signed entry; returns the finished record so callers can
    /// mirror it into persistent storage.
    pub fn append(&self, event_type: &str, actor: &str, payload: Value) -> AuditEntry {
        let mut entries = self.entries.write();
        let prev_hash = entries
            .last()
            .map(|e| e.entry_hash())
            .unwrap_or_else(|| GENESIS_HASH.to_string());

        let mut entry = AuditEntry {
            id: generate_id("audit"),
            prev_hash,
            event_type: event_type.to_string(),
            actor: actor.to_string(),
            payload,
            signature: String::new(),
            timestamp: now_secs(),
        };
        entry.signature = self.identity.sign(&entry.signed_bytes());

        entries.push(entry.clone());
        entry
    }

    /// Walk the chain; `Ok(len)` when intact, otherwise the index of the
    /// first broken link. A failure seals the chain against approvals.
    pub fn verify(&self) -> SocResult<usize> {
        let failure = {
            let entries = self.entries.read();
            let mut expected_prev = GENESIS_HASH.to_string();
            let mut failure: Option<(usize, &'static str)> = None;

            for (index, entry) in entries.iter().enumerate() {
                if entry.prev_hash != expected_prev {
                    failure = Some((index, "hash link mismatch"));
                    break;
                }
                if !verify_signature(&self.identity.pubkey, &entry.signed_bytes(), &entry.signature)
                {
                    failure = Some((index, "signature invalid"));
                    break;
                }
                expected_prev = entry.entry_hash();
            }
            match failure {
                None => return Ok(entries.len()),
                Some(f) => f,
            }
        };

        self.seal(failure.0, failure.1);
        Err(SocError::Integrity {
            index: failure.0,
            reason: failure.1.to_string(),
        })
    }

    fn seal(&self, index: usize, reason: &str) {
        if !self.sealed.swap(true, Ordering::AcqRel) {
            error!(
                "[Audit] ⛔ chain integrity violated at entry {} ({}): approvals halted",
                index, reason
            );
        }
    }

    /// While sealed, no new approvals are accepted.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Operator acknowledgement after a tamper event. Existing state stays
    /// read-only; the acknowledgement itself is recorded.
    pub fn acknowledge_tamper(&self, operator: &str) {
        warn!("[Audit] tamper acknowledged by {}", operator);
        self.sealed.store(false, Ordering::Release);
        self.append(
            "audit.tamper_acknowledged",
            operator,
            serde_json::json!({ "operator": operator }),
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries recorded for one event type, newest last.
    pub fn entries_of_type(&self, event_type: &str) -> Vec<AuditEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn export_json(&self) -> String {
        let entries = self.entries.read();
        serde_json::to_string_pretty(&*entries).unwrap_or_else(|_| "[]".to_string())
    }

    #[cfg(test)]
    pub(crate) fn tamper_payload_for_test(&self, index: usize, payload: Value) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(index) {
            entry.payload = payload;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain() -> AuditChain {
        AuditChain::new(Identity::generate("soc-runtime"))
    }

    #[test]
    fn intact_chain_verifies() {
        let chain = chain();
        chain.append("alert.published", "builder", json!({"alert_id": "a-1"}));
        chain.append("playbook.created", "analyst", json!({"playbook_id": "pb-1"}));
        chain.append("action.completed", "remediator", json!({"kind": "flag_user"}));
        assert_eq!(chain.verify().unwrap(), 3);
        assert!(!chain.is_sealed());
    }

    #[test]
    fn tamper_is_located_and_seals() {
        let chain = chain();
        for i in 0..4 {
            chain.append("event", "actor", json!({ "n": i }));
        }
        chain.tamper_payload_for_test(1, json!({"n": 999}));

        match chain.verify() {
            Err(SocError::Integrity { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected integrity error, got {:?}", other.err()),
        }
        assert!(chain.is_sealed());

        chain.acknowledge_tamper("operator-1");
        assert!(!chain.is_sealed());
    }

    #[test]
    fn entries_link_to_predecessor() {
        let chain = chain();
        chain.append("a", "x", json!({}));
        chain.append("b", "x", json!({}));
        let entries = chain.entries.read();
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
        assert_eq!(entries[1].prev_hash, entries[0].entry_hash());
    }
}
