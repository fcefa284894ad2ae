//! rustsoc-core - AI-Agent Security Operations Runtime
//!
//! This library provides the core infrastructure of a security operations
//! center for AI chat services: a multi-detector threat pipeline, an
//! analyst scoring stage, a gated remediation engine with a signed audit
//! chain, and an incremental learning loop that turns missed attacks into
//! new detector knowledge.

pub mod audit;
pub mod core;
pub mod detect;
pub mod learning;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod remediate;

// Re-export the surface most integrations need.
pub use crate::audit::identity::{Identity, TrustStore, CAP_APPROVER, CAP_OPERATOR};
pub use crate::audit::{AuditChain, AuditEntry};
pub use crate::core::bus::{MessageBus, Subscription};
pub use crate::core::config::SocConfig;
pub use crate::core::error::{SocError, SocResult};
pub use crate::core::queue::{EnqueueOutcome, RemediatorQueue};
pub use crate::core::types::{Alert, Decision, DecisionKind, LogEntry, Severity, ThreatType};
pub use crate::detect::DetectorSet;
pub use crate::learning::LearningSystem;
pub use crate::llm::LlmClient;
pub use crate::memory::AgentMemory;
pub use crate::pipeline::gateway::{ChatRequest, ChatResponse, SecurityCheck, WorkflowStep};
pub use crate::pipeline::SocRuntime;
pub use crate::remediate::actions::Action;
pub use crate::remediate::approval::ApprovalWorkflow;
pub use crate::remediate::effectors::{Effector, RemediationState, TokenBucket};
pub use crate::remediate::playbook::{Playbook, PlaybookStatus};
pub use crate::remediate::policy::{ActionContext, PolicyDecision, PolicyEngine};
pub use crate::remediate::Remediator;

/// Initialize tracing for the library.
pub fn setup_logging(level: Option<String>) {
    let filter = level.unwrap_or_else(|| "info".to_string());
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
