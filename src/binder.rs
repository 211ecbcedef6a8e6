//! Session Binder (C8).
//!
//! Maintains `task_id -> channel_id` bindings as soft state: cheaper to rebuild on
//! reconnect than to keep durably consistent. A channel registers an `mpsc` sender under a
//! `channel_id`; binding a task to that id routes its progress events there until rebound,
//! unbound, or the channel's receiver is dropped.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::model::TaskId;
use crate::registry::ProgressEvent;

pub type ChannelId = String;

pub struct SessionBinder {
    bindings: Arc<DashMap<TaskId, ChannelId>>,
    channels: Arc<DashMap<ChannelId, mpsc::UnboundedSender<ProgressEvent>>>,
    /// The last channel identity asserted by the client for a task, used by the consistency
    /// check to repair a stale binding without the client having to call `rebind` explicitly.
    last_asserted: Arc<DashMap<TaskId, ChannelId>>,
}

impl SessionBinder {
    pub fn new(consistency_check_interval: Duration) -> Self {
        let binder = Self {
            bindings: Arc::new(DashMap::new()),
            channels: Arc::new(DashMap::new()),
            last_asserted: Arc::new(DashMap::new()),
        };
        let bindings = Arc::clone(&binder.bindings);
        let channels = Arc::clone(&binder.channels);
        let last_asserted = Arc::clone(&binder.last_asserted);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(consistency_check_interval);
            loop {
                ticker.tick().await;
                for entry in bindings.iter() {
                    let (task_id, channel_id) = (entry.key().clone(), entry.value().clone());
                    let stale = channels
                        .get(&channel_id)
                        .map(|sender| sender.is_closed())
                        .unwrap_or(true);
                    if !stale {
                        continue;
                    }
                    if let Some(asserted) = last_asserted.get(&task_id) {
                        if *asserted != channel_id && channels.contains_key(asserted.value()) {
                            debug!(task_id, new_channel = %asserted.value(), "rebinding stale session to last asserted channel");
                            bindings.insert(task_id.clone(), asserted.value().clone());
                        }
                    }
                }
            }
        });
        binder
    }

    /// Registers a subscriber channel, returning the receiver end for the caller to poll/stream.
    pub fn register_channel(&self, channel_id: ChannelId) -> mpsc::UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.insert(channel_id, tx);
        rx
    }

    /// Replaces any prior binding for `task_id`.
    pub async fn bind(&self, task_id: &str, channel_id: ChannelId) {
        self.last_asserted.insert(task_id.to_string(), channel_id.clone());
        self.bindings.insert(task_id.to_string(), channel_id);
    }

    /// Atomically updates the mapping after a transport reconnect.
    pub async fn rebind(&self, task_id: &str, new_channel_id: ChannelId) {
        self.bind(task_id, new_channel_id).await;
    }

    pub async fn unbind(&self, task_id: &str) {
        self.bindings.remove(task_id);
        self.last_asserted.remove(task_id);
    }

    /// Routes an event to the currently bound channel; if none is bound, or the send fails,
    /// the event is dropped. The snapshot in the registry remains queryable regardless.
    pub async fn route(&self, event: &ProgressEvent) {
        let Some(channel_id) = self.bindings.get(&event.task_id).map(|c| c.clone()) else {
            return;
        };
        if let Some(sender) = self.channels.get(&channel_id) {
            let _ = sender.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OverallStatus, StageName};
    use crate::registry::EventType;

    fn sample_event(task_id: &str) -> ProgressEvent {
        ProgressEvent {
            event_type: EventType::AnalysisProgress,
            task_id: task_id.to_string(),
            stage: Some(StageName::DocumentParsing),
            stage_progress: Some(50),
            overall_progress: 12,
            status: OverallStatus::Running,
            message: None,
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn rebind_routes_subsequent_events_to_the_new_channel_only() {
        let binder = SessionBinder::new(Duration::from_secs(3600));
        let mut rx_a = binder.register_channel("A".to_string());
        let mut rx_b = binder.register_channel("B".to_string());

        binder.bind("T", "A".to_string()).await;
        binder.route(&sample_event("T")).await;

        binder.rebind("T", "B".to_string()).await;
        binder.route(&sample_event("T")).await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unbound_task_drops_events_without_panicking() {
        let binder = SessionBinder::new(Duration::from_secs(3600));
        binder.route(&sample_event("ghost")).await;
    }
}
