//! Pipeline assembly: Builder -> Analyst -> Remediator
//!
//! `SocRuntime` wires every component together, spawns the workers and the
//! TTL sweeper, and exposes the ingress surfaces (`ingest`, `handle_chat`).

pub mod analyst;
pub mod builder;
pub mod gateway;

#[cfg(test)]
mod scenario_test;

use crate::audit::identity::{Identity, TrustStore};
use crate::audit::AuditChain;
use crate::core::bus::MessageBus;
use crate::core::config::SocConfig;
use crate::core::error::SocResult;
use crate::core::queue::RemediatorQueue;
use crate::core::types::{Alert, LogEntry};
use crate::detect::DetectorSet;
use crate::learning::LearningSystem;
use crate::llm::LlmClient;
use crate::memory::AgentMemory;
use crate::remediate::approval::ApprovalWorkflow;
use crate::remediate::effectors::RemediationState;
use crate::remediate::playbook::Playbook;
use crate::remediate::policy::PolicyEngine;
use crate::remediate::{spawn_workers, Remediator};
use analyst::Analyst;
use builder::{Builder, TOPIC_ALERTS};
use gateway::{ChatRequest, ChatResponse, Gateway};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The assembled SOC runtime.
pub struct SocRuntime {
    pub config: SocConfig,
    pub memory: Arc<AgentMemory>,
    pub bus: Arc<MessageBus>,
    pub queue: Arc<RemediatorQueue<Playbook>>,
    pub chain: Arc<AuditChain>,
    pub trust: Arc<TrustStore>,
    pub llm: Arc<LlmClient>,
    pub detectors: Arc<DetectorSet>,
    pub state: Arc<RemediationState>,
    pub policy: Arc<PolicyEngine>,
    pub approvals: Arc<ApprovalWorkflow>,
    pub remediator: Arc<Remediator>,
    pub builder: Arc<Builder>,
    pub analyst: Arc<Analyst>,
    pub learning: Arc<LearningSystem>,
    pub gateway: Gateway,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SocRuntime {
    /// Wire every component. Nothing is spawned until `start`.
    pub fn new(config: SocConfig) -> SocResult<Arc<Self>> {
        let memory = Arc::new(AgentMemory::new(&config.memory)?);
        let bus = Arc::new(MessageBus::new(
            config.bus.subscriber_queue_capacity,
            config.bus.publish_deadline_ms,
        ));
        let queue = Arc::new(RemediatorQueue::new(config.remediation.queue_capacity));
        let chain = Arc::new(AuditChain::new(Identity::generate("soc-runtime")));
        let trust = Arc::new(TrustStore::new());
        let llm = Arc::new(LlmClient::new(config.llm.clone()));

        let detectors = Arc::new(DetectorSet::new(&config.detection, llm.clone()));
        detectors.rules.reload_from_memory(&memory);

        let state = Arc::new(RemediationState::new(memory.clone()));
        let policy = Arc::new(PolicyEngine::new());
        let approvals = Arc::new(ApprovalWorkflow::new(
            chain.clone(),
            trust.clone(),
            memory.clone(),
            config.remediation.approval_ttl_secs,
        ));
        let remediator = Arc::new(Remediator::new(
            config.remediation.clone(),
            state.clone(),
            memory.clone(),
            chain.clone(),
            policy.clone(),
            approvals.clone(),
        ));

        let (builder, outbox_flusher) = Builder::new(
            detectors.clone(),
            bus.clone(),
            memory.clone(),
            chain.clone(),
        );
        let analyst = Arc::new(Analyst::new(
            config.detection.clone(),
            config.remediation.clone(),
            memory.clone(),
            queue.clone(),
            chain.clone(),
        ));
        let learning = Arc::new(LearningSystem::new(
            memory.clone(),
            detectors.semantic.clone(),
            detectors.rules.clone(),
            llm.clone(),
        ));
        let gateway = Gateway::new(
            config.clone(),
            builder.clone(),
            analyst.clone(),
            state.clone(),
            llm.clone(),
        );

        if config.dry_run() {
            info!("[Runtime] DRY_RUN active: high-risk actions are simulated");
        }

        let runtime = Arc::new(SocRuntime {
            config,
            memory,
            bus,
            queue,
            chain,
            trust,
            llm,
            detectors,
            state,
            policy,
            approvals,
            remediator,
            builder,
            analyst,
            learning,
            gateway,
            handles: Mutex::new(vec![outbox_flusher]),
        });
        Ok(runtime)
    }

    /// Spawn the analyst worker, the remediator pool and the TTL sweeper.
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock();

        let analyst = self.analyst.clone();
        let subscription = self.bus.subscribe(TOPIC_ALERTS);
        handles.push(tokio::spawn(async move {
            analyst.run(subscription).await;
        }));

        handles.extend(spawn_workers(
            self.remediator.clone(),
            self.queue.clone(),
            self.config.remediation.worker_count,
        ));

        handles.push(self.spawn_sweeper());
        info!(
            "[Runtime] started ({} remediation workers)",
            self.config.remediation.worker_count
        );
    }

    fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let state = self.state.clone();
        let detectors = self.detectors.clone();
        let approvals = self.approvals.clone();
        let memory = self.memory.clone();
        let queue = self.queue.clone();
        let interval = Duration::from_secs(self.config.memory.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = state.sweep_expired() {
                    warn!("[Sweeper] state sweep failed: {}", e);
                }
                detectors.conversational.evict_idle();
                approvals.expire_overdue();
                requeue_parked(&memory, &queue);
            }
        })
    }

    /// Feed one log entry through the Builder.
    pub async fn ingest(&self, log: &LogEntry) -> Option<Alert> {
        self.builder.process(log).await
    }

    /// The chat ingress contract.
    pub async fn handle_chat(&self, request: ChatRequest) -> ChatResponse {
        self.gateway.handle_chat(request).await
    }

    /// Stop intake and let workers drain.
    pub fn shutdown(&self) {
        self.queue.shutdown();
        self.bus.close(TOPIC_ALERTS);
        info!("[Runtime] shutdown requested");
    }
}

/// Playbooks parked as pending under queue backpressure (no approval
/// deadline attached) re-enter the queue once there is room.
fn requeue_parked(memory: &Arc<AgentMemory>, queue: &Arc<RemediatorQueue<Playbook>>) {
    let Ok(rows) = memory.list_playbooks_with_status("pending") else {
        return;
    };
    for row in rows {
        let Ok(playbook) = serde_json::from_str::<Playbook>(&row) else {
            continue;
        };
        if playbook.expires_at.is_some() {
            continue; // awaiting a signed approval, not queue capacity
        }
        let id = playbook.id.clone();
        if queue.enqueue(playbook) == crate::core::queue::EnqueueOutcome::Accepted {
            let _ = memory.update_playbook_status(&id, "dry_run");
            info!("[Sweeper] requeued parked playbook {}", id);
        }
    }
}
