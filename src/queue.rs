//! Per-patient serialising queue manager.
//!
//! One logical FIFO and one worker task per patient with pending work.
//! Workers for different patients run fully in parallel; within a patient,
//! events are strictly ordered. A worker whose queue has been empty past the
//! configured idle timeout is torn down; a subsequent event lazily
//! re-creates everything.
//!
//! # Locking
//!
//! The registry's map of per-patient state is held only long enough to
//! look up or insert an entry — never across an `await` boundary. Event
//! delivery itself goes through an unbounded `mpsc` channel, so `enqueue`
//! never blocks the caller beyond that send.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain_types::PatientId;
use crate::event::EventEnvelope;

/// Events taking longer than this to process emit a "slow event" warning.
const SLOW_EVENT_THRESHOLD: Duration = Duration::from_secs(30);

/// How long the worker's `recv` blocks before re-checking for idle shutdown.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(5);

struct PatientQueueState {
    sender: mpsc::UnboundedSender<EventEnvelope>,
    last_activity: Arc<RwLock<Instant>>,
    worker: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Anything that can process one envelope for its owning patient. The
/// queue manager is deliberately decoupled from the router's concrete
/// type so it can be tested with a stub processor.
#[async_trait::async_trait]
pub trait EventProcessor: Send + Sync {
    /// Processes a single envelope. Must never panic; processor-internal
    /// failures are the processor's responsibility to turn into a result.
    async fn process(&self, envelope: EventEnvelope);
}

/// Owns one FIFO queue and worker per patient with pending or recent work.
pub struct QueueManager<P: EventProcessor + 'static> {
    processor: Arc<P>,
    queues: Arc<Mutex<HashMap<PatientId, PatientQueueState>>>,
    idle_timeout: Duration,
    cleanup_cancel: CancellationToken,
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<P: EventProcessor + 'static> QueueManager<P> {
    /// Builds a queue manager and starts its idle-reclamation loop.
    #[must_use]
    pub fn new(processor: Arc<P>, idle_timeout: Duration) -> Arc<Self> {
        let manager = Arc::new(Self {
            processor,
            queues: Arc::new(Mutex::new(HashMap::new())),
            idle_timeout,
            cleanup_cancel: CancellationToken::new(),
            cleanup_handle: Mutex::new(None),
        });
        manager.clone().spawn_cleanup_loop();
        manager
    }

    fn spawn_cleanup_loop(self: Arc<Self>) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = manager.cleanup_cancel.cancelled() => break,
                    () = tokio::time::sleep(QUEUE_POLL_INTERVAL) => {
                        manager.reap_idle_queues().await;
                    }
                }
            }
        });
        // Intentionally best-effort: lock is briefly re-taken, never across
        // the spawn above.
        if let Ok(mut guard) = self.cleanup_handle.try_lock() {
            *guard = Some(handle);
        }
    }

    async fn reap_idle_queues(&self) {
        let mut queues = self.queues.lock().await;
        let mut to_remove = Vec::new();
        for (patient_id, state) in queues.iter() {
            let last_activity = *state.last_activity.read().await;
            if last_activity.elapsed() >= self.idle_timeout {
                to_remove.push(patient_id.clone());
            }
        }
        for patient_id in to_remove {
            if let Some(state) = queues.remove(&patient_id) {
                state.cancel.cancel();
                info!(patient_id = %patient_id, "reclaiming idle patient queue");
            }
        }
    }

    /// Appends `envelope` to its patient's queue, lazily creating the queue
    /// and worker if needed. Non-blocking beyond the channel send itself.
    pub async fn enqueue(self: &Arc<Self>, envelope: EventEnvelope) {
        let patient_id = envelope.patient_id.clone();
        let mut queues = self.queues.lock().await;
        let state = match queues.get(&patient_id) {
            Some(state) => state,
            None => {
                let state = self.spawn_worker(patient_id.clone());
                queues.entry(patient_id.clone()).or_insert(state)
            }
        };
        *state.last_activity.write().await = Instant::now();
        if state.sender.send(envelope).is_err() {
            warn!(patient_id = %patient_id, "worker channel closed unexpectedly; dropping event");
        }
    }

    fn spawn_worker(&self, patient_id: PatientId) -> PatientQueueState {
        let (tx, mut rx) = mpsc::unbounded_channel::<EventEnvelope>();
        let last_activity = Arc::new(RwLock::new(Instant::now()));
        let cancel = CancellationToken::new();
        let processor = self.processor.clone();
        let worker_last_activity = last_activity.clone();
        let worker_cancel = cancel.clone();
        let worker_patient_id = patient_id.clone();

        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = worker_cancel.cancelled() => break,
                    maybe_event = rx.recv() => {
                        match maybe_event {
                            Some(envelope) => {
                                *worker_last_activity.write().await = Instant::now();
                                let started = Instant::now();
                                processor.process(envelope).await;
                                let elapsed = started.elapsed();
                                if elapsed > SLOW_EVENT_THRESHOLD {
                                    warn!(
                                        patient_id = %worker_patient_id,
                                        elapsed_ms = elapsed.as_millis() as u64,
                                        "slow event"
                                    );
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        PatientQueueState {
            sender: tx,
            last_activity,
            worker,
            cancel,
        }
    }

    /// Cancels the cleanup loop and tears down every worker, dropping any
    /// events still buffered in their channels (best-effort drain).
    pub async fn stop(&self) {
        self.cleanup_cancel.cancel();
        if let Some(handle) = self.cleanup_handle.lock().await.take() {
            let _ = handle.await;
        }
        let mut queues = self.queues.lock().await;
        for (_, state) in queues.drain() {
            state.cancel.cancel();
            let _ = state.worker.await;
        }
    }

    /// Number of patients with an active queue/worker, for diagnostics.
    pub async fn active_patient_count(&self) -> usize {
        self.queues.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::PatientId;
    use crate::event::{EventEnvelope, SenderRole};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProcessor {
        count: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl EventProcessor for CountingProcessor {
        async fn process(&self, envelope: EventEnvelope) {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.order.lock().await.push(envelope.text().unwrap_or_default().to_string());
        }
    }

    #[tokio::test]
    async fn events_for_one_patient_process_in_fifo_order() {
        let processor = Arc::new(CountingProcessor {
            count: AtomicUsize::new(0),
            order: Mutex::new(Vec::new()),
        });
        let manager = QueueManager::new(processor.clone(), Duration::from_secs(30));
        let pid = PatientId::try_new("PT-1").unwrap();

        for i in 0..5 {
            manager
                .enqueue(EventEnvelope::user_message(
                    pid.clone(),
                    SenderRole::Patient,
                    None,
                    format!("{i}"),
                    "sms",
                ))
                .await;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(processor.count.load(Ordering::SeqCst), 5);
        assert_eq!(*processor.order.lock().await, vec!["0", "1", "2", "3", "4"]);
        manager.stop().await;
    }

    #[tokio::test]
    async fn idle_queue_is_reclaimed() {
        let processor = Arc::new(CountingProcessor {
            count: AtomicUsize::new(0),
            order: Mutex::new(Vec::new()),
        });
        let manager = QueueManager::new(processor, Duration::from_millis(50));
        let pid = PatientId::try_new("PT-1").unwrap();
        manager
            .enqueue(EventEnvelope::user_message(pid, SenderRole::Patient, None, "hi", "sms"))
            .await;
        assert_eq!(manager.active_patient_count().await, 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(manager.active_patient_count().await, 0);
        manager.stop().await;
    }
}
