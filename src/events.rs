//! Pothole events and their delivery.
//!
//! Pipelines push one `PotholeEvent` per qualifying frame into the shared
//! `EventQueue`. An `EventNotifier` drains the queue for one subscriber while
//! a stream is active and finishes with exactly one close message.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::source::ActivityFlags;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A qualifying detection, stamped with wall-clock seconds since the epoch.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PotholeEvent {
    pub timestamp: f64,
}

impl PotholeEvent {
    pub fn now() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self { timestamp }
    }
}

/// Unbounded FIFO shared by producers (pipelines) and consumers (notifiers).
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<PotholeEvent>>,
    pushed: Condvar,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PotholeEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, event: PotholeEvent) {
        self.lock().push_back(event);
        self.pushed.notify_all();
    }

    pub fn try_pop(&self) -> Option<PotholeEvent> {
        self.lock().pop_front()
    }

    /// Pop the oldest event, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<PotholeEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = self.lock();
        loop {
            if let Some(event) = events.pop_front() {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            events = self
                .pushed
                .wait_timeout(events, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// One message for an event subscriber.
#[derive(Clone, Debug, PartialEq)]
pub enum NotifierMessage {
    Detection(PotholeEvent),
    Close,
}

impl NotifierMessage {
    /// Server-sent-events wire form.
    pub fn to_sse(&self) -> String {
        match self {
            NotifierMessage::Detection(event) => {
                let data = serde_json::to_string(event)
                    .unwrap_or_else(|_| format!("{{\"timestamp\":{}}}", event.timestamp));
                format!("event: pothole_detected\ndata: {}\n\n", data)
            }
            NotifierMessage::Close => "event: close\ndata: Connection closed\n\n".to_string(),
        }
    }
}

/// Per-subscriber event stream.
///
/// While either activity flag is set, waits up to the poll interval for the
/// next event and yields it. Once both flags are clear it yields a single
/// `Close` and ends. Events still queued at that point stay for the next
/// subscriber.
pub struct EventNotifier {
    queue: Arc<EventQueue>,
    flags: Arc<ActivityFlags>,
    poll_interval: Duration,
    closed: bool,
}

impl EventNotifier {
    pub fn new(queue: Arc<EventQueue>, flags: Arc<ActivityFlags>, poll_interval: Duration) -> Self {
        Self {
            queue,
            flags,
            poll_interval,
            closed: false,
        }
    }
}

impl Iterator for EventNotifier {
    type Item = NotifierMessage;

    fn next(&mut self) -> Option<NotifierMessage> {
        if self.closed {
            return None;
        }
        while self.flags.any_active() {
            if let Some(event) = self.queue.pop_timeout(self.poll_interval) {
                return Some(NotifierMessage::Detection(event));
            }
        }
        self.closed = true;
        Some(NotifierMessage::Close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{CameraSettings, SystemOpener};
    use crate::source::SourceManager;

    #[test]
    fn queue_is_fifo() {
        let queue = EventQueue::new();
        for t in [1.0, 2.0, 3.0] {
            queue.push(PotholeEvent { timestamp: t });
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some(PotholeEvent { timestamp: 1.0 }));
        assert_eq!(queue.try_pop(), Some(PotholeEvent { timestamp: 2.0 }));
        assert_eq!(queue.try_pop(), Some(PotholeEvent { timestamp: 3.0 }));
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_timeout_wakes_on_push() {
        let queue = Arc::new(EventQueue::new());
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(PotholeEvent { timestamp: 9.0 });
        });
        let event = queue.pop_timeout(Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(event, Some(PotholeEvent { timestamp: 9.0 }));
    }

    #[test]
    fn pop_timeout_returns_none_when_empty() {
        let queue = EventQueue::new();
        let started = Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn sse_wire_format() {
        let detection = NotifierMessage::Detection(PotholeEvent {
            timestamp: 1700000000.25,
        });
        assert_eq!(
            detection.to_sse(),
            "event: pothole_detected\ndata: {\"timestamp\":1700000000.25}\n\n"
        );
        assert_eq!(
            NotifierMessage::Close.to_sse(),
            "event: close\ndata: Connection closed\n\n"
        );
    }

    #[test]
    fn inactive_notifier_closes_once_and_leaves_events_queued() {
        let manager = SourceManager::new(Arc::new(SystemOpener), CameraSettings::default());
        let queue = Arc::new(EventQueue::new());
        queue.push(PotholeEvent::now());

        let mut notifier =
            EventNotifier::new(Arc::clone(&queue), manager.activity(), DEFAULT_POLL_INTERVAL);
        assert_eq!(notifier.next(), Some(NotifierMessage::Close));
        assert_eq!(notifier.next(), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn notifier_delivers_in_order_then_closes_when_flag_drops() {
        let manager = SourceManager::new(Arc::new(SystemOpener), CameraSettings::default());
        manager.set_file_active(true);
        let queue = Arc::new(EventQueue::new());
        queue.push(PotholeEvent { timestamp: 1.0 });
        queue.push(PotholeEvent { timestamp: 2.0 });

        let mut notifier = EventNotifier::new(
            Arc::clone(&queue),
            manager.activity(),
            Duration::from_millis(10),
        );
        assert_eq!(
            notifier.next(),
            Some(NotifierMessage::Detection(PotholeEvent { timestamp: 1.0 }))
        );
        manager.set_file_active(false);
        queue.push(PotholeEvent { timestamp: 3.0 });

        let rest: Vec<_> = notifier.collect();
        assert_eq!(rest, vec![NotifierMessage::Close]);
        // nothing is delivered twice; undelivered events wait for the next subscriber
        assert_eq!(queue.len(), 2);
    }
}
