//! End-to-end scenarios exercising the full pipeline through the public
//! API: store, router, agents, and real hand-off chains. Unlike the inline
//! unit tests in `router.rs`, these drive multi-hop chains and direct store
//! manipulation to reproduce the scenarios the safety and routing subsystems
//! are contractually required to handle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use diary_gateway::agent::{Agent, AgentRegistry};
use diary_gateway::agent_response::{AgentResult, AgentResponse};
use diary_gateway::channel::ChannelRegistry;
use diary_gateway::config::GatewayConfig;
use diary_gateway::diary::header::Phase;
use diary_gateway::diary::PatientDiary;
use diary_gateway::diary_store::{DiaryStore, SqliteDiaryStore};
use diary_gateway::domain_types::{AgentName, Generation, PatientId};
use diary_gateway::error::AgentError;
use diary_gateway::event::{EventEnvelope, EventType, SenderRole};
use diary_gateway::router::GatewayRouter;

struct UnchangedAgent {
    response: Option<&'static str>,
}

#[async_trait]
impl Agent for UnchangedAgent {
    async fn process(&self, event: &EventEnvelope, diary: PatientDiary) -> Result<AgentResult, AgentError> {
        let responses = match self.response {
            Some(text) => vec![AgentResponse::new(
                event.sender_id.clone().unwrap_or_default(),
                event.channel().unwrap_or("websocket").to_string(),
                text,
            )],
            None => Vec::new(),
        };
        Ok(AgentResult {
            updated_diary: diary,
            emitted_events: Vec::new(),
            responses,
        })
    }
}

struct RunawayIntakeAgent {
    invocations: AtomicUsize,
}

#[async_trait]
impl Agent for RunawayIntakeAgent {
    async fn process(&self, event: &EventEnvelope, diary: PatientDiary) -> Result<AgentResult, AgentError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let handoff = EventEnvelope::handoff(
            EventType::NeedsIntakeData,
            event.patient_id.clone(),
            event,
            diary_gateway::event::Payload::new(),
        );
        Ok(AgentResult {
            updated_diary: diary,
            emitted_events: vec![handoff],
            responses: Vec::new(),
        })
    }
}

fn agent_name(name: &str) -> AgentName {
    AgentName::try_new(name).unwrap()
}

async fn store_with_diary_in_phase(pid: &PatientId, phase: Phase) -> Arc<dyn DiaryStore> {
    let store: Arc<dyn DiaryStore> = Arc::new(SqliteDiaryStore::connect_in_memory().await.unwrap());
    let (mut diary, generation) = store.create(pid, None).await.unwrap();
    diary.header.current_phase = phase;
    diary.header.phase_entered_at = Utc::now();
    store.save(pid, &diary, Some(generation)).await.unwrap();
    store
}

// S2: a hand-off chain seeded mid-pipeline routes by the diary's current
// phase, not by where the chain started.
#[tokio::test]
async fn handoff_chain_routes_through_current_phase() {
    let pid = PatientId::try_new("PT-CHAIN").unwrap();
    let store = store_with_diary_in_phase(&pid, Phase::Clinical).await;

    let mut agents = AgentRegistry::default();
    agents.register(agent_name("clinical"), Arc::new(UnchangedAgent { response: Some("seen by clinical") }));

    let router = GatewayRouter::new(GatewayConfig::testing(), store, agents, ChannelRegistry::default());

    let envelope = EventEnvelope::new(EventType::IntakeComplete, pid, SenderRole::Agent, "handoff");
    let result = router.process_event(envelope).await.expect("expected a result");

    assert_eq!(result.responses.len(), 1);
    assert_eq!(result.responses[0].message, "seen by clinical");
    router.drain_background_tasks().await;
}

// S3: an agent that keeps emitting a further hand-off is cut off by the
// circuit breaker rather than looping forever.
#[tokio::test]
async fn circuit_breaker_caps_a_runaway_handoff_chain() {
    let pid = PatientId::try_new("PT-RUNAWAY").unwrap();
    let store: Arc<dyn DiaryStore> = Arc::new(SqliteDiaryStore::connect_in_memory().await.unwrap());

    let runaway = Arc::new(RunawayIntakeAgent { invocations: AtomicUsize::new(0) });
    let mut agents = AgentRegistry::default();
    agents.register(agent_name("intake"), runaway.clone());

    let router = GatewayRouter::new(GatewayConfig::testing(), store, agents, ChannelRegistry::default());
    let envelope = EventEnvelope::user_message(pid, SenderRole::Patient, None, "hi", "websocket");

    router.process_event(envelope).await;
    router.drain_background_tasks().await;

    assert_eq!(runaway.invocations.load(Ordering::SeqCst), 10);
}

// S4: the 16th user message within the rate-limit window is throttled, and
// a heartbeat for the same patient bypasses the limiter entirely.
#[tokio::test]
async fn sixteenth_message_is_rate_limited_heartbeat_is_exempt() {
    let pid = PatientId::try_new("PT-RATE").unwrap();
    let store: Arc<dyn DiaryStore> = Arc::new(SqliteDiaryStore::connect_in_memory().await.unwrap());

    let mut agents = AgentRegistry::default();
    agents.register(agent_name("intake"), Arc::new(UnchangedAgent { response: Some("ok") }));
    agents.register(agent_name("monitoring"), Arc::new(UnchangedAgent { response: Some("heartbeat handled") }));

    let router = GatewayRouter::new(GatewayConfig::testing(), store, agents, ChannelRegistry::default());

    let mut last_result = None;
    for _ in 0..16 {
        let envelope = EventEnvelope::user_message(pid.clone(), SenderRole::Patient, None, "hi", "websocket");
        last_result = router.process_event(envelope).await;
    }
    let last_result = last_result.expect("expected a result for the 16th message");
    assert_eq!(last_result.responses.len(), 1);
    assert_eq!(
        last_result.responses[0].metadata.get("rate_limited"),
        Some(&serde_json::Value::Bool(true))
    );

    let heartbeat = EventEnvelope::heartbeat(pid, 0, 14);
    let heartbeat_result = router.process_event(heartbeat).await.expect("heartbeat should still be handled");
    assert_ne!(
        heartbeat_result.responses[0].metadata.get("rate_limited"),
        Some(&serde_json::Value::Bool(true))
    );
    router.drain_background_tasks().await;
}

// S5: an unverified helper is denied at the permission check and gets a
// rejection response rather than reaching the agent.
#[tokio::test]
async fn unverified_helper_denied_before_reaching_agent() {
    let pid = PatientId::try_new("PT-PERM").unwrap();
    let store: Arc<dyn DiaryStore> = Arc::new(SqliteDiaryStore::connect_in_memory().await.unwrap());

    let invoked = Arc::new(AtomicUsize::new(0));
    struct CountingAgent {
        invoked: Arc<AtomicUsize>,
    }
    #[async_trait]
    impl Agent for CountingAgent {
        async fn process(&self, _event: &EventEnvelope, diary: PatientDiary) -> Result<AgentResult, AgentError> {
            self.invoked.fetch_add(1, Ordering::SeqCst);
            Ok(AgentResult::unchanged(diary))
        }
    }

    let mut agents = AgentRegistry::default();
    agents.register(agent_name("intake"), Arc::new(CountingAgent { invoked: invoked.clone() }));

    let router = GatewayRouter::new(GatewayConfig::testing(), store, agents, ChannelRegistry::default());
    let envelope =
        EventEnvelope::user_message(pid, SenderRole::Helper, Some("HELPER-UNVERIFIED".to_string()), "hi", "sms");

    let result = router.process_event(envelope).await.expect("expected a rejection result");
    assert!(result.responses[0].message.to_lowercase().contains("permission"));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    router.drain_background_tasks().await;
}

// S6: clinical-keyword content arriving mid-booking is handed off to
// clinical alongside whatever the primary agent (silently) does.
#[tokio::test]
async fn cross_phase_clinical_content_is_handed_off_from_booking() {
    let pid = PatientId::try_new("PT-XPHASE").unwrap();
    let store = store_with_diary_in_phase(&pid, Phase::Booking).await;

    let mut agents = AgentRegistry::default();
    agents.register(agent_name("booking"), Arc::new(UnchangedAgent { response: None }));
    agents.register(agent_name("clinical"), Arc::new(UnchangedAgent { response: Some("noted the allergy") }));

    let router = GatewayRouter::new(GatewayConfig::testing(), store, agents, ChannelRegistry::default());
    let envelope = EventEnvelope::user_message(
        pid,
        SenderRole::Patient,
        None,
        "I have a new allergy to penicillin",
        "websocket",
    );

    let result = router.process_event(envelope).await.expect("expected a result");
    assert_eq!(result.emitted_events.len(), 1);
    assert_eq!(result.emitted_events[0].event_type, EventType::CrossPhaseData);
    assert_eq!(
        result.emitted_events[0].payload.get("_target_agent"),
        Some(&serde_json::Value::String("clinical".to_string()))
    );
    router.drain_background_tasks().await;
}

// S7: a save that conflicts with a concurrently-bumped generation retries
// against the refreshed generation and still succeeds.
#[tokio::test]
async fn background_save_retries_past_a_concurrent_generation_bump() {
    let pid = PatientId::try_new("PT-CONFLICT").unwrap();
    let store: Arc<dyn DiaryStore> = Arc::new(SqliteDiaryStore::connect_in_memory().await.unwrap());

    let mut agents = AgentRegistry::default();
    agents.register(agent_name("intake"), Arc::new(UnchangedAgent { response: Some("ok") }));

    let router = GatewayRouter::new(GatewayConfig::testing(), store.clone(), agents, ChannelRegistry::default());

    let first = EventEnvelope::user_message(pid.clone(), SenderRole::Patient, None, "hi", "websocket");
    router.process_event(first).await.expect("expected a result");
    router.drain_background_tasks().await;

    let (diary, generation) = store.load(&pid).await.unwrap();
    assert_eq!(generation.as_i64(), 1);

    // Simulate an external writer bumping the generation behind the
    // router's back, staling out its cached generation.
    store.save(&pid, &diary, Some(generation)).await.unwrap();
    let (_, bumped_generation) = store.load(&pid).await.unwrap();
    assert_eq!(bumped_generation.as_i64(), 2);

    let second = EventEnvelope::user_message(pid.clone(), SenderRole::Patient, None, "hi again", "websocket");
    router.process_event(second).await.expect("expected a result");
    router.drain_background_tasks().await;

    let (_, final_generation) = store.load(&pid).await.unwrap();
    assert_eq!(final_generation.as_i64(), 3);
    let _ = Generation::first();
}

// S8: a stalled deterioration assessment is force-completed on the next
// heartbeat, escalated, and the patient is told.
#[tokio::test]
async fn stalled_assessment_is_recovered_and_escalated_on_heartbeat() {
    let pid = PatientId::try_new("PT-STALLED").unwrap();
    let store: Arc<dyn DiaryStore> = Arc::new(SqliteDiaryStore::connect_in_memory().await.unwrap());
    let (mut diary, generation) = store.create(&pid, None).await.unwrap();
    diary.header.current_phase = Phase::Monitoring;
    diary.monitoring.monitoring_active = true;
    diary.monitoring.deterioration_assessment.start();
    diary.monitoring.deterioration_assessment.started = Some(Utc::now() - chrono::Duration::hours(49));
    store.save(&pid, &diary, Some(generation)).await.unwrap();

    let mut agents = AgentRegistry::default();
    agents.register(agent_name("monitoring"), Arc::new(UnchangedAgent { response: None }));

    let router = GatewayRouter::new(GatewayConfig::testing(), store.clone(), agents, ChannelRegistry::default());
    let heartbeat = EventEnvelope::heartbeat(pid.clone(), 20, 14);

    let result = router.process_event(heartbeat).await.expect("expected a result");
    router.drain_background_tasks().await;

    assert_eq!(result.emitted_events.len(), 1);
    assert_eq!(result.emitted_events[0].event_type, EventType::DeteriorationAlert);
    assert_eq!(result.responses.len(), 1);
    assert!(result.responses[0].message.to_lowercase().contains("escalating"));

    let (saved_diary, _) = store.load(&pid).await.unwrap();
    assert!(saved_diary.monitoring.deterioration_assessment.assessment_complete);
    assert_eq!(
        saved_diary.monitoring.deterioration_assessment.severity,
        Some(diary_gateway::diary::monitoring::Severity::Moderate)
    );
    assert!(saved_diary.monitoring.has_entry_kind("assessment_timeout"));
}
