//! The Gateway router: the twenty-step `process_event` pipeline that ties
//! every other subsystem together.
//!
//! # Concurrency
//!
//! The pipeline this was designed against assumed a single cooperative
//! scheduler; on a preemptive Tokio runtime two additional guards are
//! required to preserve the same ordering guarantees: a per-patient
//! `tokio::sync::Mutex` held for the *entire* hand-off chain (not just one
//! event), and short-section mutexes around the process-global idempotency
//! cache and dead-letter queue. The per-patient mutex is taken once per call
//! to [`GatewayRouter::process_event`]; step 20 (loop-back) is implemented
//! iteratively rather than via true async recursion so the lock is held
//! continuously across an entire chain without re-entrant acquisition.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::agent::AgentRegistry;
use crate::agent_response::{AgentResponse, AgentResult};
use crate::channel::ChannelRegistry;
use crate::config::GatewayConfig;
use crate::diary::helper_registry::Permission;
use crate::diary::{ChatChannel, Direction, Phase, PatientDiary};
use crate::diary_store::DiaryStore;
use crate::domain_types::{AgentName, CorrelationId, EventId, Generation, PatientId};
use crate::error::DispatchError;
use crate::event::{EventEnvelope, EventType, SenderRole};
use crate::metrics::RouterMetrics;
use crate::permissions::PermissionChecker;
use crate::routing;
use crate::safety::{self, RateLimiter};

/// One failed agent invocation, retained for ops inspection.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    /// The event that failed.
    pub event_id: EventId,
    /// Its event type.
    pub event_type: EventType,
    /// The patient it concerned.
    pub patient_id: PatientId,
    /// The agent that raised the failure.
    pub agent_name: String,
    /// The error's variant name.
    pub error_kind: String,
    /// The error's message.
    pub error_message: String,
    /// The event's payload, for replay/diagnosis.
    pub payload: crate::event::Payload,
    /// When the failure was recorded.
    pub timestamp: chrono::DateTime<Utc>,
}

struct CacheEntry {
    diary: PatientDiary,
    generation: Option<Generation>,
}

/// Dependency-injected central router. Construct once per process behind an
/// `Arc` and share across the queue manager and heartbeat scheduler.
pub struct GatewayRouter {
    config: GatewayConfig,
    store: Arc<dyn DiaryStore>,
    agents: AgentRegistry,
    channels: ChannelRegistry,
    permissions: PermissionChecker,
    rate_limiter: RateLimiter,
    metrics: RouterMetrics,
    cache: Mutex<HashMap<PatientId, CacheEntry>>,
    idempotency: Mutex<HashMap<PatientId, VecDeque<EventId>>>,
    dlq: Mutex<VecDeque<DeadLetterEntry>>,
    patient_locks: DashMap<PatientId, Arc<Mutex<()>>>,
    background_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl GatewayRouter {
    /// Builds a router over the given store, agents, and channels.
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn DiaryStore>,
        agents: AgentRegistry,
        channels: ChannelRegistry,
    ) -> Arc<Self> {
        let rate_limiter =
            RateLimiter::new(Duration::from_secs(config.rate_limit_window_secs), config.rate_limit_threshold.into());
        Arc::new(Self {
            config,
            store,
            agents,
            channels,
            permissions: PermissionChecker::default(),
            rate_limiter,
            metrics: RouterMetrics::default(),
            cache: Mutex::new(HashMap::new()),
            idempotency: Mutex::new(HashMap::new()),
            dlq: Mutex::new(VecDeque::new()),
            patient_locks: DashMap::new(),
            background_tasks: Mutex::new(Vec::new()),
        })
    }

    /// Metrics accumulated since process start.
    #[must_use]
    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    /// Current dead-letter queue size.
    pub async fn dlq_size(&self) -> usize {
        self.dlq.lock().await.len()
    }

    /// Aggregate health-check snapshot.
    pub async fn health(&self) -> crate::metrics::HealthStatus {
        let diary_store_available = self.store.list_all_patient_ids().await.is_ok();
        crate::metrics::HealthStatus {
            agents_registered: self.agents.len(),
            agent_names: self.agents.agent_names(),
            channels_registered: self.channels.len(),
            channel_names: self.channels.channel_names(),
            diary_store_available,
            overall_healthy: diary_store_available && !self.agents.is_empty(),
        }
    }

    /// Awaits every outstanding background save task. Tests rely on this to
    /// observe a diary in the store immediately after the pipeline returns.
    pub async fn drain_background_tasks(&self) {
        let mut tasks = self.background_tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }

    fn patient_lock(&self, patient_id: &PatientId) -> Arc<Mutex<()>> {
        self.patient_locks
            .entry(patient_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Entry point: processes `envelope` and the entire hand-off chain it
    /// spawns, returning the root event's result. Never returns an `Err`;
    /// every failure mode resolves to `Some`/`None` per the error taxonomy.
    pub async fn process_event(self: &Arc<Self>, envelope: EventEnvelope) -> Option<AgentResult> {
        let lock = self.patient_lock(&envelope.patient_id);
        let _guard = lock.lock().await;

        let mut queue = VecDeque::from([envelope]);
        let mut root_result = None;
        let mut is_root = true;

        while let Some(current) = queue.pop_front() {
            let span = tracing::span!(
                tracing::Level::INFO,
                "process_event",
                patient_id = %current.patient_id,
                event_id = %current.event_id,
                event_type = ?current.event_type,
                chain_depth = current.chain_depth.as_u32(),
            );
            let _enter = span.enter();

            let parent_was_monitoring = current.flag("_parent_chat_channel_monitoring");
            let result = self.process_one(current).await;

            if let Some(result) = &result {
                let this_was_monitoring = result
                    .responses
                    .first()
                    .and_then(|r| r.metadata.get("chat_channel"))
                    .map(|v| v == &Value::String("monitoring".to_string()))
                    .unwrap_or(parent_was_monitoring);

                for mut emitted in result.emitted_events.clone() {
                    if this_was_monitoring && !emitted.payload.contains_key("_source_chat_channel") {
                        emitted
                            .payload
                            .insert("_source_chat_channel".to_string(), Value::String("monitoring".to_string()));
                    }
                    if this_was_monitoring {
                        emitted.set_flag("_parent_chat_channel_monitoring", true);
                    }
                    queue.push_back(emitted);
                }
            }

            if is_root {
                root_result = result;
                is_root = false;
            }
        }

        root_result
    }

    /// Steps 1-19 of the pipeline for a single envelope. Step 20 (loop-back)
    /// is driven by the caller, [`Self::process_event`].
    #[allow(clippy::too_many_lines)]
    async fn process_one(self: &Arc<Self>, mut envelope: EventEnvelope) -> Option<AgentResult> {
        // Step 1: chain_depth already carried on the envelope (default 0).
        let chain_depth = envelope.chain_depth.as_u32();

        // Step 2: idempotency.
        if self.is_duplicate(&envelope).await {
            info!(event_id = %envelope.event_id, "duplicate event, dropping");
            return None;
        }

        // Step 3: rate limiting.
        if safety::is_rate_limit_eligible(envelope.event_type, chain_depth)
            && self.rate_limiter.record_and_check(&envelope.patient_id)
        {
            self.metrics.record_rate_limited();
            warn!(patient_id = %envelope.patient_id, "rate limited");
            let mut response = AgentResponse::new(
                envelope.sender_id.clone().unwrap_or_default(),
                envelope.channel().unwrap_or("websocket").to_string(),
                "You're sending messages a bit fast — please wait a moment before trying again.",
            );
            response.metadata.insert("rate_limited".to_string(), Value::Bool(true));
            let diary = self.load_or_create(&envelope.patient_id, envelope.correlation_id).await;
            return Some(AgentResult {
                updated_diary: diary,
                emitted_events: Vec::new(),
                responses: vec![response],
            });
        }

        // Step 4: circuit breaker.
        if chain_depth >= u32::from(self.config.circuit_breaker_depth) {
            warn!(patient_id = %envelope.patient_id, "circuit breaker tripped, dropping");
            return None;
        }

        // Step 5: load-or-create diary.
        let mut diary = self.load_or_create(&envelope.patient_id, envelope.correlation_id).await;

        // Step 6: cross-phase timeout.
        if diary.cross_phase_state.is_stale(Duration::from_secs(self.config.cross_phase_timeout_secs)) {
            diary.cross_phase_state.clear();
        }

        // Safety subsystem: stalled-assessment recovery and phase-staleness
        // nudges are a heartbeat-triggered Gateway responsibility, not
        // something the monitoring agent decides.
        let (safety_responses, safety_emitted) = if envelope.event_type == EventType::Heartbeat {
            self.apply_heartbeat_safety_checks(&envelope, &mut diary)
        } else {
            (Vec::new(), Vec::new())
        };

        // Step 7: permissions.
        let sender_permissions = self.sender_permissions(&diary, &envelope);
        let permission = self.permissions.check(
            envelope.sender_role,
            &sender_permissions,
            envelope.event_type,
            diary.header.current_phase,
        );
        if !permission.allowed {
            warn!(reason = %permission.reason, "permission denied");
            let response = AgentResponse::new(
                envelope.sender_id.clone().unwrap_or_default(),
                envelope.channel().unwrap_or("websocket").to_string(),
                format!("You don't have permission to do that ({}).", permission.reason),
            );
            self.update_cache(&envelope.patient_id, diary.clone()).await;
            return Some(AgentResult {
                updated_diary: diary,
                emitted_events: Vec::new(),
                responses: vec![response],
            });
        }

        // Step 8: cross-phase content pre-detection.
        let mut cross_phase_targets: Vec<&'static str> = Vec::new();
        let from_phase = diary.header.current_phase;
        let already_in_followup = diary.cross_phase_state.active && diary.cross_phase_state.awaiting_response;
        if chain_depth == 0 && envelope.event_type == EventType::UserMessage && !already_in_followup {
            if let Some(text) = envelope.text() {
                cross_phase_targets = routing::detect_cross_phase_targets(text, from_phase);
                if !cross_phase_targets.is_empty() {
                    envelope.set_flag("_has_cross_phase_content", true);
                    envelope.payload.insert(
                        "_cross_phase_targets".to_string(),
                        Value::Array(cross_phase_targets.iter().map(|t| Value::String((*t).to_string())).collect()),
                    );
                }
            }
        }

        // Step 9: target resolution.
        let target_agent_name = if already_in_followup {
            envelope.set_flag("_cross_phase_followup", true);
            diary.cross_phase_state.target_agent.clone()
        } else {
            self.resolve_target(envelope.event_type, diary.header.current_phase, &envelope)
        };

        let Some(target_agent_name) = target_agent_name else {
            info!("no routable target, logging and returning");
            self.update_cache(&envelope.patient_id, diary.clone()).await;
            return Some(AgentResult::unchanged(diary));
        };

        let Ok(agent_name) = AgentName::try_new(target_agent_name.clone()) else {
            warn!(target = %target_agent_name, "invalid agent name");
            return Some(AgentResult::unchanged(diary));
        };

        let Some(agent) = self.agents.get(&agent_name) else {
            warn!(target = %target_agent_name, "AGENT_NOT_FOUND");
            self.update_cache(&envelope.patient_id, diary.clone()).await;
            return Some(AgentResult {
                updated_diary: diary,
                emitted_events: safety_emitted,
                responses: safety_responses,
            });
        };

        // Step 10: input truncation.
        if envelope.event_type == EventType::UserMessage {
            if let Some(text) = envelope.text() {
                let mut text = text.to_string();
                if safety::truncate_message(&mut text) {
                    warn!(patient_id = %envelope.patient_id, "user message truncated");
                    envelope.set_text(text);
                }
            }
        }

        // Document dedup (safety subsystem contract, applied before the agent runs).
        if envelope.event_type == EventType::DocumentUploaded {
            if let Some(hash) = envelope.payload.get("content_hash").and_then(Value::as_str) {
                if safety::is_duplicate_document(&diary, hash) {
                    let response = AgentResponse::new(
                        envelope.sender_id.clone().unwrap_or_default(),
                        envelope.channel().unwrap_or("websocket").to_string(),
                        "We've already received this document, thanks.",
                    );
                    self.update_cache(&envelope.patient_id, diary.clone()).await;
                    return Some(AgentResult {
                        updated_diary: diary,
                        emitted_events: Vec::new(),
                        responses: vec![response],
                    });
                }
            }
        }

        // Step 11: inbound conversation entry.
        let inbound_chat_channel = self.resolve_chat_channel(&envelope, diary.header.current_phase, None);
        diary.append_conversation_entry(
            Direction::Inbound,
            envelope.channel().unwrap_or("unknown").to_string(),
            envelope.text().unwrap_or_default().to_string(),
            inbound_chat_channel,
            self.config.conversation_log_cap,
        );

        // Step 12: capture phase-before.
        let phase_before = diary.header.current_phase;

        // Step 13: invoke agent.
        let started = Instant::now();
        let agent_result = agent.process(&envelope, diary).await;
        let elapsed = started.elapsed();
        self.metrics.record_agent_duration(target_agent_name.as_str(), elapsed);

        let mut result = match agent_result {
            Ok(result) => {
                self.metrics.record_processed();
                result
            }
            Err(error) => {
                self.metrics.record_failed();
                warn!(agent = %target_agent_name, error = %error, "agent exception");
                let reloaded = self.load_or_create(&envelope.patient_id, envelope.correlation_id).await;
                self.record_dlq(&envelope, &target_agent_name, &error).await;
                let response = AgentResponse::new(
                    envelope.sender_id.clone().unwrap_or_default(),
                    envelope.channel().unwrap_or("websocket").to_string(),
                    "Sorry, something went wrong on our end. We're looking into it.",
                );
                self.update_cache(&envelope.patient_id, reloaded.clone()).await;
                return Some(AgentResult {
                    updated_diary: reloaded,
                    emitted_events: Vec::new(),
                    responses: vec![response],
                });
            }
        };

        result.responses.extend(safety_responses);
        result.emitted_events.extend(safety_emitted);

        // Step 14: cross-phase event emission.
        if !cross_phase_targets.is_empty() && result.responses.is_empty() {
            for target in &cross_phase_targets {
                let mut payload = crate::event::Payload::new();
                payload.insert("_target_agent".to_string(), Value::String((*target).to_string()));
                payload.insert(
                    "text".to_string(),
                    Value::String(envelope.text().unwrap_or_default().to_string()),
                );
                payload.insert(
                    "from_phase".to_string(),
                    serde_json::to_value(from_phase).unwrap_or(Value::Null),
                );
                if let Some(channel) = envelope.channel() {
                    payload.insert("channel".to_string(), Value::String(channel.to_string()));
                }
                result.emitted_events.push(EventEnvelope::handoff(
                    EventType::CrossPhaseData,
                    envelope.patient_id.clone(),
                    &envelope,
                    payload,
                ));
                result.updated_diary.cross_phase_extractions.push(crate::diary::CrossPhaseExtraction {
                    from_phase,
                    target_agent: (*target).to_string(),
                    text: envelope.text().unwrap_or_default().to_string(),
                    timestamp: Utc::now(),
                });
            }
        }

        // Step 15: stamp outbound channel + outbound conversation entries.
        let outbound_chat_channel = self.resolve_chat_channel(
            &envelope,
            result.updated_diary.header.current_phase,
            Some(target_agent_name.as_str()),
        );
        for response in &mut result.responses {
            response.set_metadata_if_absent(
                "chat_channel",
                serde_json::to_value(outbound_chat_channel).unwrap_or(Value::Null),
            );
            result.updated_diary.append_conversation_entry(
                Direction::Outbound,
                response.channel.clone(),
                response.message.clone(),
                outbound_chat_channel,
                self.config.conversation_log_cap,
            );
        }

        // Step 16: phase-transition stamping.
        if result.updated_diary.header.current_phase != phase_before {
            result.updated_diary.header.phase_entered_at = Utc::now();
        }

        // Step 17: cache update.
        result.updated_diary.touch();
        self.update_cache(&envelope.patient_id, result.updated_diary.clone()).await;

        // Step 18: dispatch responses (awaited synchronously).
        let delivery_results = self.channels.dispatch_all(&result.responses).await;
        for (response, delivery) in result.responses.iter().zip(delivery_results.iter()) {
            if delivery.success {
                continue;
            }
            let dispatch_error = if self.channels.is_registered(&response.channel) {
                DispatchError::SendFailed {
                    message: delivery.error.clone().unwrap_or_default(),
                }
            } else {
                DispatchError::NoDispatcher {
                    channel: response.channel.clone(),
                }
            };
            warn!(patient_id = %envelope.patient_id, error = %dispatch_error, "dispatch failed");
            self.metrics.record_dispatch_failure();
        }

        // Step 19: background save with retry, detached from this call.
        self.spawn_background_save(envelope.patient_id.clone(), result.updated_diary.clone()).await;

        debug!(chat_channel = outbound_chat_channel_tag(outbound_chat_channel), "process_one complete");

        Some(result)
    }

    async fn is_duplicate(&self, envelope: &EventEnvelope) -> bool {
        let mut idempotency = self.idempotency.lock().await;
        let seen = idempotency.entry(envelope.patient_id.clone()).or_default();
        if seen.contains(&envelope.event_id) {
            return true;
        }
        seen.push_back(envelope.event_id);
        while seen.len() > usize::from(self.config.idempotency_cache_size) {
            seen.pop_front();
        }
        false
    }

    async fn load_or_create(&self, patient_id: &PatientId, correlation_id: Option<CorrelationId>) -> PatientDiary {
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(patient_id) {
                return entry.diary.clone();
            }
        }

        let (diary, generation) = match self.store.load(patient_id).await {
            Ok((diary, generation)) => (diary, Some(generation)),
            Err(_) => (PatientDiary::new(patient_id.clone(), correlation_id), None),
        };

        let mut cache = self.cache.lock().await;
        cache.insert(
            patient_id.clone(),
            CacheEntry {
                diary: diary.clone(),
                generation,
            },
        );
        diary
    }

    async fn update_cache(&self, patient_id: &PatientId, diary: PatientDiary) {
        let mut cache = self.cache.lock().await;
        let generation = cache.get(patient_id).and_then(|e| e.generation);
        cache.insert(patient_id.clone(), CacheEntry { diary, generation });
    }

    fn sender_permissions(&self, diary: &PatientDiary, envelope: &EventEnvelope) -> Vec<Permission> {
        if envelope.sender_role != SenderRole::Helper {
            return Vec::new();
        }
        let Some(sender_id) = &envelope.sender_id else {
            return Vec::new();
        };
        let Ok(helper_id) = crate::domain_types::HelperId::try_new(sender_id.clone()) else {
            return Vec::new();
        };
        diary
            .helper_registry
            .lookup_by_id(&helper_id)
            .filter(|h| h.verified)
            .map(|h| h.permissions.clone())
            .unwrap_or_default()
    }

    fn resolve_target(&self, event_type: EventType, phase: Phase, envelope: &EventEnvelope) -> Option<String> {
        match event_type {
            EventType::CrossPhaseData => envelope
                .payload
                .get("_target_agent")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            EventType::CrossPhaseReprompt => envelope
                .payload
                .get("_pending_phase")
                .and_then(Value::as_str)
                .and_then(|p| serde_json::from_value::<Phase>(Value::String(p.to_string())).ok())
                .and_then(routing::phase_target)
                .map(ToString::to_string),
            _ if routing::is_phase_based(event_type) => routing::phase_target(phase).map(ToString::to_string),
            _ => routing::explicit_target(event_type).map(ToString::to_string),
        }
    }

    fn resolve_chat_channel(&self, envelope: &EventEnvelope, phase: Phase, agent_name: Option<&str>) -> ChatChannel {
        if let Some(Value::String(explicit)) = envelope.payload.get("_source_chat_channel") {
            if explicit == "monitoring" {
                return ChatChannel::Monitoring;
            }
            return ChatChannel::PreConsultation;
        }
        if agent_name == Some("monitoring") || phase == Phase::Monitoring {
            return ChatChannel::Monitoring;
        }
        ChatChannel::PreConsultation
    }

    async fn record_dlq(&self, envelope: &EventEnvelope, agent_name: &str, error: &crate::error::AgentError) {
        let mut dlq = self.dlq.lock().await;
        dlq.push_back(DeadLetterEntry {
            event_id: envelope.event_id,
            event_type: envelope.event_type,
            patient_id: envelope.patient_id.clone(),
            agent_name: agent_name.to_string(),
            error_kind: "AgentError::Processing".to_string(),
            error_message: error.to_string(),
            payload: envelope.payload.clone(),
            timestamp: Utc::now(),
        });
        while dlq.len() > usize::from(self.config.dlq_capacity) {
            dlq.pop_front();
        }
    }

    /// Stalled-assessment recovery and phase-staleness nudges, triggered by
    /// heartbeat processing per the safety subsystem contract.
    fn apply_heartbeat_safety_checks(
        &self,
        envelope: &EventEnvelope,
        diary: &mut PatientDiary,
    ) -> (Vec<AgentResponse>, Vec<EventEnvelope>) {
        let mut responses = Vec::new();
        let mut emitted = Vec::new();
        let assessment_timeout = Duration::from_secs(self.config.assessment_timeout_hours * 3600);
        let monitoring_cap = self.config.monitoring_entries_cap;

        if safety::recover_stalled_assessment(diary, assessment_timeout, monitoring_cap)
            && safety::warrants_deterioration_alert(diary)
        {
            responses.push(AgentResponse::new(
                envelope.sender_id.clone().unwrap_or_default(),
                envelope.channel().unwrap_or("websocket").to_string(),
                "We haven't heard back from you, so we're escalating this to the clinical team.",
            ));
            emitted.push(EventEnvelope::handoff(
                EventType::DeteriorationAlert,
                envelope.patient_id.clone(),
                envelope,
                crate::event::Payload::new(),
            ));
        }

        if safety::phase_is_newly_stale(diary) {
            let phase = diary.header.current_phase;
            let kind = safety::phase_stale_entry_kind(phase);
            diary.monitoring.push_entry(
                crate::diary::monitoring::MonitoringEntry {
                    kind: kind.clone(),
                    detail: format!("{phase:?} phase exceeded its staleness SLA with no response"),
                    timestamp: Utc::now(),
                },
                monitoring_cap,
            );
            diary.monitoring.alerts_fired.push(kind);
            responses.push(AgentResponse::new(
                envelope.sender_id.clone().unwrap_or_default(),
                envelope.channel().unwrap_or("websocket").to_string(),
                "We haven't heard from you in a while — is there anything we can help with?",
            ));
        }

        (responses, emitted)
    }

    /// Schedules a detached retrying save, tracked so shutdown/tests can
    /// drain it via [`Self::drain_background_tasks`].
    async fn spawn_background_save(self: &Arc<Self>, patient_id: PatientId, diary: PatientDiary) {
        let router = self.clone();
        let backoff = self.config.save_retry_backoff_ms.clone();
        let retries = u32::from(self.config.save_retry_count) as usize;

        let handle = tokio::spawn(async move {
            let mut attempt_generation = {
                let cache = router.cache.lock().await;
                cache.get(&patient_id).and_then(|e| e.generation)
            };

            let mut saved_generation = None;
            for delay_ms in backoff.iter().take(retries) {
                match router.store.save(&patient_id, &diary, attempt_generation).await {
                    Ok(new_generation) => {
                        saved_generation = Some(new_generation);
                        break;
                    }
                    Err(crate::error::DiaryStoreError::Concurrency { .. }) => {
                        if let Ok((_, refreshed)) = router.store.load(&patient_id).await {
                            attempt_generation = Some(refreshed);
                        }
                        tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                    }
                    Err(error) => {
                        warn!(patient_id = %patient_id, error = %error, "background save failed");
                        tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                    }
                }
            }

            match saved_generation {
                Some(generation) => {
                    let mut cache = router.cache.lock().await;
                    if let Some(entry) = cache.get_mut(&patient_id) {
                        entry.generation = Some(generation);
                    }
                }
                None => {
                    router.metrics.record_diary_save_failure();
                }
            }

            let mirror_dir = std::path::Path::new(&router.config.chat_mirror_dir);
            if let Err(error) = crate::diary_store::write_chat_mirrors(mirror_dir, &patient_id, &diary).await {
                warn!(patient_id = %patient_id, %error, "chat mirror write failed");
            }
        });

        self.background_tasks.lock().await.push(handle);
    }
}

fn outbound_chat_channel_tag(channel: ChatChannel) -> &'static str {
    match channel {
        ChatChannel::PreConsultation => "pre_consultation",
        ChatChannel::Monitoring => "monitoring",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::agent_response::AgentResult;
    use crate::diary_store::SqliteDiaryStore;
    use crate::domain_types::AgentName;
    use crate::event::{EventEnvelope, SenderRole};
    use async_trait::async_trait;

    struct EchoIntake;

    #[async_trait]
    impl Agent for EchoIntake {
        async fn process(&self, event: &EventEnvelope, mut diary: PatientDiary) -> Result<AgentResult, crate::error::AgentError> {
            let response = AgentResponse::new(
                event.sender_id.clone().unwrap_or_default(),
                event.channel().unwrap_or("websocket").to_string(),
                "thanks, got it",
            );
            diary.intake.mark_field_collected("full_name", "Jo Smith");
            Ok(AgentResult {
                updated_diary: diary,
                emitted_events: Vec::new(),
                responses: vec![response],
            })
        }
    }

    async fn router_with_intake() -> Arc<GatewayRouter> {
        let store = Arc::new(SqliteDiaryStore::connect_in_memory().await.unwrap());
        let mut agents = AgentRegistry::default();
        agents.register(AgentName::try_new("intake").unwrap(), Arc::new(EchoIntake));
        GatewayRouter::new(GatewayConfig::testing(), store, agents, ChannelRegistry::default())
    }

    #[tokio::test]
    async fn first_contact_creates_diary_and_invokes_intake() {
        let router = router_with_intake().await;
        let pid = PatientId::try_new("PT-1").unwrap();
        let envelope = EventEnvelope::user_message(pid, SenderRole::Patient, None, "hi", "websocket");

        let result = router.process_event(envelope).await.expect("expected a result");
        assert_eq!(result.responses.len(), 1);
        assert_eq!(result.updated_diary.header.current_phase, Phase::Intake);
        router.drain_background_tasks().await;
    }

    #[tokio::test]
    async fn duplicate_event_id_produces_no_second_invocation() {
        let router = router_with_intake().await;
        let pid = PatientId::try_new("PT-1").unwrap();
        let envelope = EventEnvelope::user_message(pid, SenderRole::Patient, None, "hi", "websocket");
        let replay = envelope.clone();

        assert!(router.process_event(envelope).await.is_some());
        assert!(router.process_event(replay).await.is_none());
        router.drain_background_tasks().await;
    }

    #[tokio::test]
    async fn circuit_breaker_drops_events_past_max_chain_depth() {
        let router = router_with_intake().await;
        let pid = PatientId::try_new("PT-1").unwrap();
        let mut envelope = EventEnvelope::user_message(pid, SenderRole::Patient, None, "hi", "websocket");
        envelope.chain_depth = crate::domain_types::ChainDepth::try_new(10).unwrap();

        assert!(router.process_event(envelope).await.is_none());
    }

    #[tokio::test]
    async fn unverified_helper_is_denied_and_gets_a_rejection_response() {
        let router = router_with_intake().await;
        let pid = PatientId::try_new("PT-1").unwrap();
        let mut envelope = EventEnvelope::user_message(pid, SenderRole::Helper, Some("HELPER-001".to_string()), "hi", "sms");
        envelope.sender_role = SenderRole::Helper;

        let result = router.process_event(envelope).await.expect("expected a rejection result");
        assert_eq!(result.responses.len(), 1);
        assert!(result.responses[0].message.to_lowercase().contains("permission"));
        router.drain_background_tasks().await;
    }
}
