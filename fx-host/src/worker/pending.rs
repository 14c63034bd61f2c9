use {
    std::collections::HashMap,
    tokio::sync::{Notify, oneshot},
    parking_lot::Mutex,
    crate::{data_cache::CacheHandle, error::InvocationError, invocation::InvocationResult},
};

pub(crate) type InvocationOutcome = Result<InvocationResult, InvocationError>;

/// Invocation waiting for its response. Completed exactly once by whoever removes it from
/// [`PendingInvocations`].
pub(crate) struct PendingInvocation {
    sender: oneshot::Sender<InvocationOutcome>,
    pub(crate) function_name: String,
    pub(crate) cache_handles: Vec<CacheHandle>,
}

impl PendingInvocation {
    pub(crate) fn new(function_name: String) -> (Self, oneshot::Receiver<InvocationOutcome>) {
        let (sender, receiver) = oneshot::channel();
        let pending = Self {
            sender,
            function_name,
            cache_handles: Vec::new(),
        };
        (pending, receiver)
    }

    /// Caller may be gone already (timed out or cancelled), that is fine.
    pub(crate) fn complete(self, outcome: InvocationOutcome) {
        let _ = self.sender.send(outcome);
    }
}

pub(crate) struct PendingInvocations {
    inner: Mutex<HashMap<String, PendingInvocation>>,
    removed: Notify,
}

impl PendingInvocations {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            removed: Notify::new(),
        }
    }

    /// Registers the invocation. Gives the entry back if the id is already in flight.
    pub(crate) fn insert(&self, invocation_id: &str, pending: PendingInvocation) -> Result<(), PendingInvocation> {
        let mut inner = self.inner.lock();
        if inner.contains_key(invocation_id) {
            return Err(pending);
        }
        inner.insert(invocation_id.to_owned(), pending);
        Ok(())
    }

    pub(crate) fn remove(&self, invocation_id: &str) -> Option<PendingInvocation> {
        let removed = self.inner.lock().remove(invocation_id);
        if removed.is_some() {
            self.removed.notify_waiters();
        }
        removed
    }

    /// Runs `f` on the entry if it is still pending.
    pub(crate) fn update(&self, invocation_id: &str, f: impl FnOnce(&mut PendingInvocation)) -> bool {
        match self.inner.lock().get_mut(invocation_id) {
            Some(pending) => {
                f(pending);
                true
            },
            None => false,
        }
    }

    pub(crate) fn drain(&self) -> Vec<(String, PendingInvocation)> {
        let drained: Vec<_> = self.inner.lock().drain().collect();
        if !drained.is_empty() {
            self.removed.notify_waiters();
        }
        drained
    }

    pub(crate) fn contains(&self, invocation_id: &str) -> bool {
        self.inner.lock().contains_key(invocation_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once all invocations pending at some point after the call were removed.
    pub(crate) async fn wait_empty(&self) {
        loop {
            let removed = self.removed.notified();
            tokio::pin!(removed);
            removed.as_mut().enable();
            if self.is_empty() {
                return;
            }
            removed.await;
        }
    }
}
