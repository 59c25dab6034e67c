// src/events.rs - Caller-visible notification channel
use std::path::PathBuf;

use tokio::sync::broadcast;
use uuid::Uuid;

/// Notifications observers care about: staged-file metadata before a job
/// starts, raw response lines, and terminal job notices.
#[derive(Debug, Clone)]
pub enum HostEvent {
    FileStaged {
        path: PathBuf,
        size: u64,
        plate_index: u32,
    },
    Response(String),
    JobStarted {
        job_id: Uuid,
    },
    JobCompleted {
        job_id: Uuid,
    },
    JobErrored {
        job_id: Uuid,
        message: String,
    },
}

/// Broadcast fan-out for `HostEvent`s. Sending never fails; events are
/// dropped when nobody is subscribed.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HostEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: HostEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("no event subscribers, notification dropped");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.emit(HostEvent::Response("no one listening".into()));
    }

    #[test]
    fn subscribers_receive_events_in_order() {
        tokio_test::block_on(async {
            let bus = EventBus::new(4);
            let mut rx = bus.subscribe();
            bus.emit(HostEvent::Response("first".into()));
            bus.emit(HostEvent::JobStarted {
                job_id: Uuid::new_v4(),
            });
            assert!(matches!(rx.recv().await.unwrap(), HostEvent::Response(s) if s == "first"));
            assert!(matches!(
                rx.recv().await.unwrap(),
                HostEvent::JobStarted { .. }
            ));
        });
    }
}
