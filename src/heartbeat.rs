//! Heartbeat scheduler: an in-process periodic loop that drives milestone
//! check-ins and GP-reminder nudges for monitoring-active patients.
//!
//! Every emission goes through the same [`crate::queue::QueueManager`] used
//! for inbound traffic, so per-patient FIFO ordering is never bypassed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::diary_store::DiaryStore;
use crate::domain_types::PatientId;
use crate::event::EventEnvelope;
use crate::queue::QueueManager;

/// Milestones checked in ascending order; the smallest one not yet due wins.
const MILESTONES_DAYS: &[i64] = &[14, 30, 60, 90];

/// GP queries pending longer than this get a reminder.
const GP_REMINDER_AFTER: Duration = Duration::from_secs(48 * 3600);

struct Registration {
    #[allow(dead_code)]
    appointment_date: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
}

/// Drives periodic `HEARTBEAT`/`GP_REMINDER` emission for every registered,
/// monitoring-active patient.
pub struct HeartbeatScheduler<P: crate::queue::EventProcessor + 'static> {
    store: Arc<dyn DiaryStore>,
    queue: Arc<QueueManager<P>>,
    registrations: Mutex<HashMap<PatientId, Registration>>,
    tick_interval: Duration,
    cancel: CancellationToken,
}

impl<P: crate::queue::EventProcessor + 'static> HeartbeatScheduler<P> {
    /// Builds a scheduler. Call [`Self::recover_on_startup`] once before
    /// [`Self::spawn`] to repopulate registrations from the store.
    #[must_use]
    pub fn new(store: Arc<dyn DiaryStore>, queue: Arc<QueueManager<P>>, tick_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue,
            registrations: Mutex::new(HashMap::new()),
            tick_interval,
            cancel: CancellationToken::new(),
        })
    }

    /// Best-effort startup recovery: enumerates monitoring-active patients
    /// and registers each. Failures are logged, never fatal.
    pub async fn recover_on_startup(&self) {
        match self.store.list_monitoring_patients().await {
            Ok(patient_ids) => {
                for patient_id in patient_ids {
                    let appointment_date = match self.store.load(&patient_id).await {
                        Ok((diary, _)) => diary.monitoring.appointment_date,
                        Err(_) => None,
                    };
                    self.register(patient_id, appointment_date).await;
                }
            }
            Err(error) => warn!(%error, "heartbeat startup recovery failed to enumerate monitoring patients"),
        }
    }

    /// Registers `patient_id` for heartbeat ticks.
    pub async fn register(&self, patient_id: PatientId, appointment_date: Option<DateTime<Utc>>) {
        self.registrations.lock().await.insert(
            patient_id,
            Registration {
                appointment_date,
                last_heartbeat: None,
            },
        );
    }

    /// Removes `patient_id` from the scheduler.
    pub async fn unregister(&self, patient_id: &PatientId) {
        self.registrations.lock().await.remove(patient_id);
    }

    /// Number of currently registered patients.
    pub async fn registered_count(&self) -> usize {
        self.registrations.lock().await.len()
    }

    /// Spawns the periodic tick loop.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = scheduler.cancel.cancelled() => break,
                    () = tokio::time::sleep(scheduler.tick_interval) => {
                        scheduler.tick().await;
                    }
                }
            }
        })
    }

    /// Cancels the tick loop cooperatively.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn tick(&self) {
        let patient_ids: Vec<PatientId> = self.registrations.lock().await.keys().cloned().collect();
        for patient_id in patient_ids {
            self.tick_one(&patient_id).await;
        }
    }

    async fn tick_one(&self, patient_id: &PatientId) {
        let Ok((diary, _)) = self.store.load(patient_id).await else {
            return;
        };

        if !diary.monitoring.monitoring_active {
            self.unregister(patient_id).await;
            return;
        }

        if let Some(appointment_date) = diary.monitoring.appointment_date {
            let days_since = (Utc::now() - appointment_date).num_days();
            let due_milestone = MILESTONES_DAYS
                .iter()
                .filter(|&&m| m <= days_since)
                .max()
                .copied()
                .filter(|milestone| !diary.monitoring.has_entry_kind(&format!("heartbeat_{milestone}d")));

            if let Some(milestone) = due_milestone {
                info!(patient_id = %patient_id, milestone, "emitting heartbeat milestone");
                let envelope = EventEnvelope::heartbeat(patient_id.clone(), days_since, u32::try_from(milestone).unwrap_or(0));
                self.queue.enqueue(envelope).await;
                let mut registrations = self.registrations.lock().await;
                if let Some(registration) = registrations.get_mut(patient_id) {
                    registration.last_heartbeat = Some(Utc::now());
                }
            }
        }

        for query in &diary.gp_channel.queries {
            if query.status == crate::diary::gp_channel::GpQueryStatus::Pending
                && query.reminder_sent.is_none()
                && crate::safety::older_than(query.sent, GP_REMINDER_AFTER)
            {
                info!(patient_id = %patient_id, query_id = %query.id, "emitting gp reminder");
                let mut payload = crate::event::Payload::new();
                payload.insert(
                    "gp_query_id".to_string(),
                    serde_json::Value::String(query.id.to_string()),
                );
                let mut envelope = EventEnvelope::new(
                    crate::event::EventType::GpReminder,
                    patient_id.clone(),
                    crate::event::SenderRole::System,
                    "heartbeat_scheduler",
                );
                envelope.payload = payload;
                self.queue.enqueue(envelope).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diary_store::SqliteDiaryStore;
    use crate::domain_types::PatientId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProcessor {
        count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl crate::queue::EventProcessor for CountingProcessor {
        async fn process(&self, _envelope: EventEnvelope) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn scheduler_with_store(
        store: Arc<dyn DiaryStore>,
    ) -> (Arc<HeartbeatScheduler<CountingProcessor>>, Arc<CountingProcessor>, Arc<QueueManager<CountingProcessor>>) {
        let processor = Arc::new(CountingProcessor {
            count: AtomicUsize::new(0),
        });
        let queue = QueueManager::new(processor.clone(), Duration::from_secs(30));
        let scheduler = HeartbeatScheduler::new(store, queue.clone(), Duration::from_secs(3600));
        (scheduler, processor, queue)
    }

    #[tokio::test]
    async fn register_and_unregister_track_count() {
        let store: Arc<dyn DiaryStore> = Arc::new(SqliteDiaryStore::connect_in_memory().await.unwrap());
        let (scheduler, _processor, queue) = scheduler_with_store(store).await;
        let pid = PatientId::try_new("PT-1").unwrap();

        scheduler.register(pid.clone(), Some(Utc::now())).await;
        assert_eq!(scheduler.registered_count().await, 1);

        scheduler.unregister(&pid).await;
        assert_eq!(scheduler.registered_count().await, 0);
        queue.stop().await;
    }

    #[tokio::test]
    async fn due_milestone_enqueues_heartbeat_and_sets_last_heartbeat() {
        let store: Arc<dyn DiaryStore> = Arc::new(SqliteDiaryStore::connect_in_memory().await.unwrap());
        let pid = PatientId::try_new("PT-1").unwrap();
        let (mut diary, generation) = store.create(&pid, None).await.unwrap();
        diary.monitoring.monitoring_active = true;
        diary.monitoring.appointment_date = Some(Utc::now() - chrono::Duration::days(15));
        store.save(&pid, &diary, Some(generation)).await.unwrap();

        let (scheduler, processor, queue) = scheduler_with_store(store).await;
        scheduler.register(pid.clone(), Some(Utc::now() - chrono::Duration::days(15))).await;

        scheduler.tick_one(&pid).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(processor.count.load(Ordering::SeqCst), 1);
        let registrations = scheduler.registrations.lock().await;
        assert!(registrations.get(&pid).unwrap().last_heartbeat.is_some());
        drop(registrations);
        queue.stop().await;
    }

    #[tokio::test]
    async fn inactive_monitoring_unregisters_patient() {
        let store: Arc<dyn DiaryStore> = Arc::new(SqliteDiaryStore::connect_in_memory().await.unwrap());
        let pid = PatientId::try_new("PT-1").unwrap();
        store.create(&pid, None).await.unwrap();

        let (scheduler, _processor, queue) = scheduler_with_store(store).await;
        scheduler.register(pid.clone(), None).await;

        scheduler.tick_one(&pid).await;
        assert_eq!(scheduler.registered_count().await, 0);
        queue.stop().await;
    }
}
