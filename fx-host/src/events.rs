//! In-process event bus connecting worker channels, the dispatcher and the host.
//!
//! Publishing never blocks and never runs subscriber code: every subscriber owns an
//! unbounded queue and consumes it on its own task.

use {
    std::{
        collections::HashMap,
        path::PathBuf,
        sync::{Arc, Weak, atomic::{AtomicU64, Ordering}},
    },
    parking_lot::Mutex,
};

pub const SOURCE_WORKER_CHANNEL: &str = "worker_channel";
pub const SOURCE_WORKER_PROCESS: &str = "worker_process";
pub const SOURCE_DISPATCHER: &str = "dispatcher";
pub const SOURCE_HOST: &str = "host";
pub const SOURCE_FILE_WATCHER: &str = "file_watcher";

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptEvent {
    pub source: String,
    pub kind: ScriptEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptEventKind {
    /// Worker channel faulted. `recoverable` is false for protocol faults, where restarting
    /// the same worker will not help.
    WorkerError {
        language: String,
        worker_id: String,
        reason: String,
        recoverable: bool,
    },
    WorkerRestart {
        language: String,
        worker_id: String,
        attempt: usize,
    },
    WorkerUnavailable {
        language: String,
        reason: String,
    },
    WorkerProcessExited {
        language: String,
        worker_id: String,
        pid: Option<u32>,
        exit_code: Option<i32>,
        stderr: Vec<String>,
    },
    HostShutdown,
    HostRestart,
    FileChanged {
        path: PathBuf,
    },
    Diagnostic {
        message: String,
    },
}

impl ScriptEvent {
    pub fn new(source: impl Into<String>, kind: ScriptEventKind) -> Self {
        Self {
            source: source.into(),
            kind,
        }
    }
}

type EventFilter = Box<dyn Fn(&ScriptEvent) -> bool + Send + Sync>;

struct Subscriber {
    filter: Option<EventFilter>,
    sender: flume::Sender<ScriptEvent>,
}

pub struct ScriptEventManager {
    /// `None` once disposed.
    subscribers: Mutex<Option<HashMap<u64, Subscriber>>>,
    next_id: AtomicU64,
}

impl ScriptEventManager {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Some(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Delivers the event to every current subscriber whose filter accepts it.
    pub fn publish(&self, event: ScriptEvent) {
        let mut subscribers = self.subscribers.lock();
        let Some(subscribers) = subscribers.as_mut() else {
            return;
        };

        subscribers.retain(|_, subscriber| {
            if subscriber.filter.as_ref().is_some_and(|filter| !filter(&event)) {
                return true;
            }
            subscriber.sender.send(event.clone()).is_ok()
        });
    }

    pub fn subscribe(self: &Arc<Self>) -> EventSubscription {
        self.add_subscriber(None)
    }

    pub fn subscribe_filtered(
        self: &Arc<Self>,
        filter: impl Fn(&ScriptEvent) -> bool + Send + Sync + 'static,
    ) -> EventSubscription {
        self.add_subscriber(Some(Box::new(filter)))
    }

    fn add_subscriber(self: &Arc<Self>, filter: Option<EventFilter>) -> EventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = flume::unbounded();

        if let Some(subscribers) = self.subscribers.lock().as_mut() {
            subscribers.insert(id, Subscriber { filter, sender });
        }

        EventSubscription {
            id,
            receiver,
            manager: Arc::downgrade(self),
        }
    }

    /// Completes every subscription. Subscriptions created afterwards are completed immediately.
    pub fn dispose(&self) {
        self.subscribers.lock().take();
    }

    pub fn is_disposed(&self) -> bool {
        self.subscribers.lock().is_none()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().as_ref().map(|v| v.len()).unwrap_or(0)
    }

    fn unsubscribe(&self, id: u64) {
        if let Some(subscribers) = self.subscribers.lock().as_mut() {
            subscribers.remove(&id);
        }
    }
}

/// Stream of events for one subscriber. Dropping it unsubscribes.
pub struct EventSubscription {
    id: u64,
    receiver: flume::Receiver<ScriptEvent>,
    manager: Weak<ScriptEventManager>,
}

impl EventSubscription {
    /// Next event, `None` once the manager is disposed and the queue is drained.
    pub async fn recv(&self) -> Option<ScriptEvent> {
        self.receiver.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<ScriptEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.unsubscribe(self.id);
        }
    }
}
