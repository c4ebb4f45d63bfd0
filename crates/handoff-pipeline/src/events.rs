//! Event delivery: a broadcast channel for live subscribers plus a bounded
//! buffer of recent events for pollers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use handoff_types::EngineEvent;
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Fan-out of engine events.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    recent: Mutex<VecDeque<EngineEvent>>,
    capacity: usize,
    seq: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            seq: AtomicU64::new(1),
        }
    }

    /// Stamp the event with the next sequence number and deliver it.
    pub fn emit(&self, mut event: EngineEvent) -> EngineEvent {
        // Sequence and buffer order must agree, so both happen under the lock.
        let mut recent = self.recent.lock();
        event.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(event.clone());
        drop(recent);

        tracing::info!(
            seq = event.seq,
            kind = %event.kind,
            workflow_id = %event.workflow_id,
            stage = event.stage.as_deref().unwrap_or("-"),
            "{}",
            event.detail
        );
        // No subscribers is fine.
        let _ = self.sender.send(event.clone());
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Buffered events, oldest first.
    pub fn recent(&self) -> Vec<EngineEvent> {
        self.recent.lock().iter().cloned().collect()
    }

    /// Buffered events with a sequence number greater than `after`.
    pub fn since(&self, after: u64) -> Vec<EngineEvent> {
        self.recent
            .lock()
            .iter()
            .filter(|e| e.seq > after)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handoff_types::EventKind;

    #[test]
    fn test_recent_buffer_is_bounded() {
        let bus = EventBus::new(2);
        for i in 0..3 {
            bus.emit(EngineEvent::new(EventKind::Completed, format!("wf-{}", i), ""));
        }
        let recent = bus.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].workflow_id, "wf-1");
        assert_eq!(recent[1].seq, 3);
        assert_eq!(bus.since(2).len(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::new(EventKind::Delayed, "wf", "retry 1").with_stage("spike"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Delayed);
        assert_eq!(event.stage.as_deref(), Some("spike"));
        assert_eq!(event.seq, 1);
    }
}
