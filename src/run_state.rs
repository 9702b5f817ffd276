use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;
use tracing::debug;

/// Process-wide "a training run is in progress" flag.
///
/// The flag can only be raised through [`RunState::try_acquire`], which hands
/// out a [`RunPermit`]; dropping the permit lowers the flag again, including
/// when the holder unwinds from a panic.
#[derive(Debug, Default)]
pub struct RunState {
    running: AtomicBool,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The single instance used by the binary. Tests build their own with
    /// [`RunState::new`].
    pub fn global() -> Arc<RunState> {
        static INSTANCE: Lazy<Arc<RunState>> = Lazy::new(|| Arc::new(RunState::new()));
        INSTANCE.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Raise the flag if nobody holds it. Returns `None` when a run is already
    /// in progress.
    pub fn try_acquire(self: &Arc<Self>) -> Option<RunPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| {
                debug!("Pipeline run permit acquired");
                RunPermit {
                    state: Arc::clone(self),
                }
            })
    }
}

#[derive(Debug)]
pub struct RunPermit {
    state: Arc<RunState>,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
        debug!("Pipeline run permit released");
    }
}
