use {
    std::collections::HashSet,
    tracing::{debug, warn},
    parking_lot::Mutex,
    nix::{sys::signal::{Signal, kill}, unistd::Pid},
};

/// Tracks worker processes so they do not outlive the host.
pub trait ProcessRegistry: Send + Sync {
    fn register(&self, pid: u32) -> bool;

    fn unregister(&self, pid: u32);
}

/// Kills every registered worker on `terminate_all` or when dropped.
pub struct PlatformProcessRegistry {
    pids: Mutex<HashSet<u32>>,
}

impl PlatformProcessRegistry {
    pub fn new() -> Self {
        Self {
            pids: Mutex::new(HashSet::new()),
        }
    }

    pub fn registered(&self) -> Vec<u32> {
        self.pids.lock().iter().copied().collect()
    }

    pub fn terminate_all(&self) {
        let pids: Vec<u32> = self.pids.lock().drain().collect();
        for pid in pids {
            let Ok(raw) = i32::try_from(pid) else {
                continue;
            };
            match kill(Pid::from_raw(raw), Signal::SIGKILL) {
                Ok(()) => debug!(pid, "killed worker process"),
                Err(nix::errno::Errno::ESRCH) => {},
                Err(err) => warn!(pid, "failed to kill worker process: {err:?}"),
            }
        }
    }
}

impl ProcessRegistry for PlatformProcessRegistry {
    fn register(&self, pid: u32) -> bool {
        self.pids.lock().insert(pid)
    }

    fn unregister(&self, pid: u32) {
        self.pids.lock().remove(&pid);
    }
}

impl Drop for PlatformProcessRegistry {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

pub struct NoopProcessRegistry;

impl ProcessRegistry for NoopProcessRegistry {
    fn register(&self, _pid: u32) -> bool {
        true
    }

    fn unregister(&self, _pid: u32) {}
}
