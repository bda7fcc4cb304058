//! Notification bus (spec §4.1 Notification, §5 notification-listener
//! activity, §6 Notifications emitted).
//!
//! Generalises the donor `crawl_events::CrawlEventBus` (a `broadcast`
//! channel with `pressure()`/`is_overloaded()` backpressure signalling) into
//! a two-layer design: Postgres `LISTEN`/`NOTIFY` carries the
//! durable, cross-process wake signal (message payload is only a job id, as
//! required), while an in-process `broadcast` channel fans that signal out
//! to local idle workers without each of them polling the listener socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::store::Store;

pub const CHANNEL_TASKS: &str = "bbbee_tasks";
pub const CHANNEL_JOBS: &str = "bbbee_jobs";

/// A lightweight wake event. Payload is only an id, per §6: consumers fetch
/// details through the job/task read path, never from the event itself.
#[derive(Debug, Clone, Copy)]
pub enum Event {
    TasksAvailable { job_id: Uuid },
    JobStarted { job_id: Uuid },
    JobCompleted { job_id: Uuid },
    JobFailed { job_id: Uuid },
    JobCancelled { job_id: Uuid },
}

impl Event {
    #[must_use]
    pub fn job_id(self) -> Uuid {
        match self {
            Event::TasksAvailable { job_id }
            | Event::JobStarted { job_id }
            | Event::JobCompleted { job_id }
            | Event::JobFailed { job_id }
            | Event::JobCancelled { job_id } => job_id,
        }
    }

    #[must_use]
    pub fn channel(self) -> &'static str {
        match self {
            Event::TasksAvailable { .. } => CHANNEL_TASKS,
            Event::JobStarted { .. }
            | Event::JobCompleted { .. }
            | Event::JobFailed { .. }
            | Event::JobCancelled { .. } => CHANNEL_JOBS,
        }
    }
}

/// In-process fan-out bus that idle workers subscribe to, with the same
/// `pressure()`/`is_overloaded()` backpressure signal the donor bus exposes.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    capacity: usize,
    overload_threshold: f64,
    reconnects: Arc<AtomicUsize>,
    listening: Arc<AtomicBool>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            overload_threshold: 0.8,
            reconnects: Arc::new(AtomicUsize::new(0)),
            listening: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Locally fan out an event (used by the listener task after a
    /// `NOTIFY` arrives, and directly by in-process callers that just
    /// committed a transaction).
    pub fn publish_local(&self, event: Event) {
        // A lagging or absent receiver is not a failure: workers that
        // missed the wake fall back to their poll-interval safety net.
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn pressure(&self) -> f64 {
        self.sender.len() as f64 / self.capacity as f64
    }

    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        self.pressure() >= self.overload_threshold
    }

    #[must_use]
    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Maintain a persistent `LISTEN` subscription against the store,
    /// republishing every payload as a local [`Event`]. Reconnects with
    /// capped exponential backoff on connection loss, nulling the failed
    /// handle out before retrying so no stale listener is retained across
    /// a reconnect attempt (§5's leak-avoidance requirement).
    pub async fn run_listener(self: Arc<Self>, store: Store, poll_fallback: Duration) {
        let mut backoff = Duration::from_millis(200);
        const MAX_BACKOFF: Duration = Duration::from_secs(30);

        loop {
            let mut listener = match store.listener(&[CHANNEL_TASKS, CHANNEL_JOBS]).await {
                Ok(listener) => {
                    self.listening.store(true, Ordering::Relaxed);
                    backoff = Duration::from_millis(200);
                    listener
                }
                Err(err) => {
                    self.listening.store(false, Ordering::Relaxed);
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    log::warn!("notification listener connect failed: {err}; retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            loop {
                let recv = tokio::time::timeout(poll_fallback, listener.recv()).await;
                match recv {
                    Ok(Ok(notification)) => {
                        if let Some(event) = parse_notification(notification.channel(), notification.payload()) {
                            self.publish_local(event);
                        }
                    }
                    Ok(Err(err)) => {
                        log::warn!("notification listener lost connection: {err}");
                        listener = match store.listener(&[CHANNEL_TASKS, CHANNEL_JOBS]).await {
                            Ok(l) => l,
                            Err(_) => break,
                        };
                    }
                    Err(_timeout) => {
                        // Fallback poll tick: no event lost, just the
                        // safety net the spec requires against missed
                        // NOTIFY delivery.
                    }
                }
            }

            self.listening.store(false, Ordering::Relaxed);
        }
    }
}

fn parse_notification(channel: &str, payload: &str) -> Option<Event> {
    let job_id = Uuid::parse_str(payload).ok()?;
    match channel {
        CHANNEL_TASKS => Some(Event::TasksAvailable { job_id }),
        CHANNEL_JOBS => Some(Event::JobStarted { job_id }),
        _ => None,
    }
}

/// Issue a `NOTIFY` on commit, per §4.1: "on commit of `EnqueueBatch` or on
/// job status changes, publish a lightweight wake event".
pub async fn notify(store: &Store, event: Event) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(event.channel())
        .bind(event.job_id().to_string())
        .execute(store.pool())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pressure_reflects_queue_depth() {
        let bus = EventBus::new(4);
        let _rx = bus.subscribe();
        assert_eq!(bus.pressure(), 0.0);
        bus.publish_local(Event::TasksAvailable { job_id: Uuid::new_v4() });
        bus.publish_local(Event::TasksAvailable { job_id: Uuid::new_v4() });
        assert!((bus.pressure() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn is_overloaded_respects_threshold() {
        let bus = EventBus::new(2);
        let _rx = bus.subscribe();
        bus.publish_local(Event::TasksAvailable { job_id: Uuid::new_v4() });
        bus.publish_local(Event::TasksAvailable { job_id: Uuid::new_v4() });
        assert!(bus.is_overloaded());
    }

    #[test]
    fn parse_notification_roundtrips_job_id() {
        let id = Uuid::new_v4();
        let event = parse_notification(CHANNEL_TASKS, &id.to_string()).unwrap();
        assert_eq!(event.job_id(), id);
        assert!(matches!(event, Event::TasksAvailable { .. }));
    }

    #[test]
    fn parse_notification_rejects_garbage_payload() {
        assert!(parse_notification(CHANNEL_TASKS, "not-a-uuid").is_none());
    }
}
