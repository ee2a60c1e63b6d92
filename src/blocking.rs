//! Serialized blocking work for collaborators built on blocking drivers.
//!
//! The orchestrator bounds every call with a timeout, which drops the
//! caller's future but cannot stop a `spawn_blocking` closure. A
//! [`BlockingLane`] keeps the handle of such an abandoned closure and waits
//! for it before starting the next one, so two closures on the same lane
//! never run at the same time.

use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tracing::warn;

pub struct BlockingLane<T> {
    in_flight: Mutex<Option<JoinHandle<T>>>,
}

impl<T: Send + 'static> BlockingLane<T> {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(None),
        }
    }

    /// Run `f` on the blocking pool once everything queued before it is done.
    ///
    /// Cancel-safe: if the returned future is dropped, the closure keeps its
    /// place on the lane and the next call waits for it.
    pub async fn run<F>(&self, f: F) -> Result<T, JoinError>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let mut slot = self.in_flight.lock().await;
        if let Some(abandoned) = slot.as_mut() {
            warn!("Waiting for an abandoned blocking call to finish");
            // its result was already given up on by the caller that timed out
            let _ = abandoned.await;
        }
        let task = slot.insert(tokio::task::spawn_blocking(f));
        let result = task.await;
        *slot = None;
        result
    }

    /// Whether nothing is queued or running.
    pub async fn is_idle(&self) -> bool {
        self.in_flight.lock().await.is_none()
    }
}

impl<T: Send + 'static> Default for BlockingLane<T> {
    fn default() -> Self {
        Self::new()
    }
}
