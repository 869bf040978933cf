use std::fmt::{self, Display};

use parking_lot::Mutex;
use tracing::trace;

/// Which family of keyspace events a notification belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    String,
    Generic,
}

impl Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventClass::String => write!(f, "string"),
            EventClass::Generic => write!(f, "generic"),
        }
    }
}

/// A mutation observed on a key, emitted after the change is visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceEvent {
    pub class: EventClass,
    /// Lowercase event name, e.g. `set`, `append`, `expired`
    pub event: &'static str,
    pub key: Vec<u8>,
    pub db: u32,
}

impl Display for KeyspaceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "__keyspace@{}__:{} {} ({})",
            self.db,
            String::from_utf8_lossy(&self.key),
            self.event,
            self.class
        )
    }
}

/// Sink for keyspace events. Called on the writer thread.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: KeyspaceEvent);
}

impl<F> Notifier for F
where
    F: Fn(KeyspaceEvent) + Send + Sync,
{
    fn notify(&self, event: KeyspaceEvent) {
        self(event)
    }
}

/// Emits every event as a TRACE record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: KeyspaceEvent) {
        trace!(
            target: "quiver::keyspace",
            db = event.db,
            class = %event.class,
            event = event.event,
            key = %String::from_utf8_lossy(&event.key),
            "notify"
        );
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<KeyspaceEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything recorded so far.
    pub fn take(&self) -> Vec<KeyspaceEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Event names recorded so far, oldest first.
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.event).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Notifier for EventLog {
    fn notify(&self, event: KeyspaceEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    fn event(name: &'static str) -> KeyspaceEvent {
        KeyspaceEvent {
            class: EventClass::String,
            event: name,
            key: b"k".to_vec(),
            db: 0,
        }
    }

    #[test]
    fn test_event_log() {
        let log = EventLog::new();
        log.notify(event("set"));
        log.notify(event("append"));
        assert_eq!(log.names(), vec!["set", "append"]);
        assert_eq!(log.take().len(), 2);
        assert!(log.is_empty());
    }

    #[test]
    fn test_closure_notifier() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let notifier = move |_: KeyspaceEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        };
        notifier.notify(event("incrby"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_display() {
        assert_eq!(event("set").to_string(), "__keyspace@0__:k set (string)");
    }
}
