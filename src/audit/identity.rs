//! Cryptographic identities and the trust store
//!
//! Ed25519 identities sign audit entries and approval decisions; the trust
//! store maps principals to public keys and capability sets.

use crate::core::error::{SocError, SocResult};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::{HashMap, HashSet};

/// Capability required to sign playbook approvals.
pub const CAP_APPROVER: &str = "approver";
/// Capability required to acknowledge audit-chain tampering.
pub const CAP_OPERATOR: &str = "operator";

/// A signing identity for one principal (analyst, approver, the runtime itself).
#[derive(Clone)]
pub struct Identity {
    signing_key_bytes: [u8; 32],
    pub principal: String,
    pub pubkey: String,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate(principal: &str) -> Self {
        let mut key_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut key_bytes);

        let signing_key = SigningKey::from_bytes(&key_bytes);
        let verifying_key = VerifyingKey::from(&signing_key);

        Identity {
            signing_key_bytes: key_bytes,
            principal: principal.to_string(),
            pubkey: hex::encode(verifying_key.to_bytes()),
        }
    }

    /// Rebuild an identity from a private key hex string.
    pub fn from_hex(principal: &str, hex_key: &str) -> SocResult<Self> {
        let bytes =
            hex::decode(hex_key).map_err(|e| SocError::Validation(format!("bad key hex: {}", e)))?;
        if bytes.len() != 32 {
            return Err(SocError::Validation("invalid key length".to_string()));
        }
        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&bytes);

        let signing_key = SigningKey::from_bytes(&key_bytes);
        let verifying_key = VerifyingKey::from(&signing_key);

        Ok(Identity {
            signing_key_bytes: key_bytes,
            principal: principal.to_string(),
            pubkey: hex::encode(verifying_key.to_bytes()),
        })
    }

    pub fn sign(&self, data: &[u8]) -> String {
        let signing_key = SigningKey::from_bytes(&self.signing_key_bytes);
        let signature: Signature = signing_key.sign(data);
        hex::encode(signature.to_bytes())
    }
}

/// Verify a hex signature against a hex public key.
pub fn verify_signature(pubkey_hex: &str, data: &[u8], signature_hex: &str) -> bool {
    let Ok(key_bytes) = hex::decode(pubkey_hex) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    if key_bytes.len() != 32 || sig_bytes.len() != 64 {
        return false;
    }
    let mut kb = [0u8; 32];
    kb.copy_from_slice(&key_bytes);
    let mut sb = [0u8; 64];
    sb.copy_from_slice(&sig_bytes);

    let Ok(verifying_key) = VerifyingKey::from_bytes(&kb) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sb) else {
        return false;
    };
    verifying_key.verify(data, &signature).is_ok()
}

struct TrustedPrincipal {
    pubkey: String,
    capabilities: HashSet<String>,
}

/// Registry of trusted principals, their public keys, and capabilities.
pub struct TrustStore {
    principals: RwLock<HashMap<String, TrustedPrincipal>>,
}

impl TrustStore {
    pub fn new() -> Self {
        TrustStore {
            principals: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_principal(
        &self,
        principal: &str,
        pubkey_hex: &str,
        capabilities: &[&str],
    ) -> SocResult<()> {
        let bytes = hex::decode(pubkey_hex)
            .map_err(|e| SocError::Validation(format!("bad pubkey hex: {}", e)))?;
        if bytes.len() != 32 {
            return Err(SocError::Validation("invalid public key length".to_string()));
        }
        let mut principals = self.principals.write();
        principals.insert(
            principal.to_string(),
            TrustedPrincipal {
                pubkey: pubkey_hex.to_string(),
                capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            },
        );
        Ok(())
    }

    /// Register an identity we hold the private key for.
    pub fn add_identity(&self, identity: &Identity, capabilities: &[&str]) -> SocResult<()> {
        self.add_principal(&identity.principal, &identity.pubkey, capabilities)
    }

    pub fn has_capability(&self, principal: &str, capability: &str) -> bool {
        let principals = self.principals.read();
        principals
            .get(principal)
            .map(|p| p.capabilities.contains(capability))
            .unwrap_or(false)
    }

    /// Verify a signature claimed by a principal against its registered key.
    pub fn verify(&self, principal: &str, data: &[u8], signature_hex: &str) -> bool {
        let pubkey = {
            let principals = self.principals.read();
            match principals.get(principal) {
                Some(p) => p.pubkey.clone(),
                None => return false,
            }
        };
        verify_signature(&pubkey, data, signature_hex)
    }

    pub fn remove_principal(&self, principal: &str) {
        self.principals.write().remove(principal);
    }
}

impl Default for TrustStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let id = Identity::generate("approver-1");
        let sig = id.sign(b"approve playbook pb-1");
        assert!(verify_signature(&id.pubkey, b"approve playbook pb-1", &sig));
        assert!(!verify_signature(&id.pubkey, b"approve playbook pb-2", &sig));
    }

    #[test]
    fn capability_gating() {
        let store = TrustStore::new();
        let approver = Identity::generate("alice");
        let bystander = Identity::generate("bob");
        store.add_identity(&approver, &[CAP_APPROVER]).unwrap();
        store.add_identity(&bystander, &[]).unwrap();

        assert!(store.has_capability("alice", CAP_APPROVER));
        assert!(!store.has_capability("bob", CAP_APPROVER));
        assert!(!store.has_capability("carol", CAP_APPROVER));
    }

    #[test]
    fn verify_rejects_wrong_principal_key() {
        let store = TrustStore::new();
        let alice = Identity::generate("alice");
        let mallory = Identity::generate("mallory");
        store.add_identity(&alice, &[CAP_APPROVER]).unwrap();

        let sig = mallory.sign(b"payload");
        assert!(!store.verify("alice", b"payload", &sig));
    }
}
