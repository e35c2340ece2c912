use crate::model::{EventFrame, EventKind};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

struct Channel {
    tx: broadcast::Sender<EventFrame>,
    next_sequence: u64,
}

/// In-memory fan-out of runner events, one channel per execution. Frames
/// are ephemeral: slow subscribers lag and reconnecting clients fall back
/// to the status endpoint.
#[derive(Default)]
pub struct EventBus {
    channels: Mutex<HashMap<i64, Channel>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, execution_id: i64, kind: EventKind, payload: serde_json::Value) {
        let mut channels = self.channels.lock().unwrap();
        let ch = channels.entry(execution_id).or_insert_with(|| Channel {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
            next_sequence: 1,
        });
        let frame = EventFrame {
            execution_id,
            sequence: ch.next_sequence,
            kind,
            payload,
            at: chrono::Utc::now().to_rfc3339(),
        };
        ch.next_sequence += 1;
        let _ = ch.tx.send(frame); // no subscribers is fine
    }

    pub fn subscribe(&self, execution_id: i64) -> broadcast::Receiver<EventFrame> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(execution_id)
            .or_insert_with(|| Channel {
                tx: broadcast::channel(CHANNEL_CAPACITY).0,
                next_sequence: 1,
            })
            .tx
            .subscribe()
    }

    /// Emits the terminal frame and tears the channel down.
    pub fn complete(&self, execution_id: i64, payload: serde_json::Value) {
        self.emit(execution_id, EventKind::Complete, payload);
        self.channels.lock().unwrap().remove(&execution_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequences_are_monotonic_from_one() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(7);
        bus.emit(7, EventKind::CaseStarted, serde_json::json!({"case_id": 1}));
        bus.emit(7, EventKind::CaseFinished, serde_json::json!({"case_id": 1}));
        bus.complete(7, serde_json::json!({}));

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        let c = rx.recv().await.unwrap();
        assert_eq!((a.sequence, b.sequence, c.sequence), (1, 2, 3));
        assert_eq!(c.kind, EventKind::Complete);
    }

    #[tokio::test]
    async fn executions_do_not_share_channels() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe(1);
        bus.emit(2, EventKind::CaseStarted, serde_json::json!({}));
        bus.emit(1, EventKind::CaseStarted, serde_json::json!({}));
        let frame = rx1.recv().await.unwrap();
        assert_eq!(frame.execution_id, 1);
    }
}
