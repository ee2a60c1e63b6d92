//! Session/connection management.
//!
//! The browser process and its page outlive every step; the per-step control
//! wiring does not. A [`SessionManager`] owns one long-lived
//! [`BrowserConnection`] and hands out a freshly wired [`SessionHandle`] for
//! each step, tearing down the previous handle's wiring first.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::ConnectionError;

/// A long-lived connection to one browser process.
#[async_trait]
pub trait BrowserConnection: Send + Sync {
    /// Per-step handle type the execution engine works with.
    type Handle: Send + Sync;

    /// Check that the connection is usable.
    async fn probe(&self) -> Result<(), ConnectionError>;

    /// Re-establish the connection to the same browser process and page.
    async fn reconnect(&self) -> Result<(), ConnectionError>;

    /// Wire a new handle with no listeners carried over from earlier ones.
    async fn wire(&self, generation: u64) -> Result<Self::Handle, ConnectionError>;

    /// Drop the wiring of a handle that is no longer in use.
    async fn unwire(&self, handle: Self::Handle);
}

/// Short-lived view of the persistent connection, valid for one step.
#[derive(Debug)]
pub struct SessionHandle<H> {
    generation: u64,
    inner: H,
}

impl<H> SessionHandle<H> {
    pub fn new(generation: u64, inner: H) -> Self {
        Self { generation, inner }
    }

    /// Monotonic per-manager counter; 1 for the first handle.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

pub struct SessionManager<C: BrowserConnection> {
    connection: C,
    generation: u64,
    current: Option<SessionHandle<C::Handle>>,
}

impl<C: BrowserConnection> SessionManager<C> {
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            generation: 0,
            current: None,
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Generation of the most recently issued handle (0 before the first).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Issue a fresh handle backed by the same browser connection.
    ///
    /// The previous handle is unwired before the new one is created. If the
    /// connection does not answer a probe, one reconnect is attempted; a
    /// failed reconnect surfaces as [`ConnectionError`] and the caller decides
    /// whether to retry.
    pub async fn acquire_handle(&mut self) -> Result<&SessionHandle<C::Handle>, ConnectionError> {
        if let Some(previous) = self.current.take() {
            debug!(generation = previous.generation, "Unwiring previous session handle");
            self.connection.unwire(previous.inner).await;
        }

        if let Err(e) = self.connection.probe().await {
            warn!(error = %e, "Browser connection probe failed, reconnecting");
            self.connection.reconnect().await?;
            info!("Reconnected to browser");
        }

        let generation = self.generation + 1;
        let inner = self.connection.wire(generation).await?;
        self.generation = generation;
        debug!(generation, "Wired fresh session handle");

        let handle: &SessionHandle<C::Handle> =
            self.current.insert(SessionHandle::new(generation, inner));
        Ok(handle)
    }

    /// The handle issued by the last successful [`acquire_handle`](Self::acquire_handle).
    pub fn current(&self) -> Option<&SessionHandle<C::Handle>> {
        self.current.as_ref()
    }

    /// Unwire the outstanding handle, if any. The connection stays open.
    pub async fn release(&mut self) {
        if let Some(handle) = self.current.take() {
            self.connection.unwire(handle.inner).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeConnection {
        alive: AtomicBool,
        reconnect_ok: AtomicBool,
        reconnects: AtomicUsize,
        wired: Mutex<Vec<u64>>,
        unwired: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl BrowserConnection for FakeConnection {
        type Handle = u64;

        async fn probe(&self) -> Result<(), ConnectionError> {
            if self.alive.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ConnectionError::Unreachable("probe".into()))
            }
        }

        async fn reconnect(&self) -> Result<(), ConnectionError> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            if self.reconnect_ok.load(Ordering::SeqCst) {
                self.alive.store(true, Ordering::SeqCst);
                Ok(())
            } else {
                Err(ConnectionError::Unreachable("reconnect".into()))
            }
        }

        async fn wire(&self, generation: u64) -> Result<u64, ConnectionError> {
            self.wired.lock().unwrap().push(generation);
            Ok(generation)
        }

        async fn unwire(&self, handle: u64) {
            self.unwired.lock().unwrap().push(handle);
        }
    }

    fn alive() -> FakeConnection {
        let conn = FakeConnection::default();
        conn.alive.store(true, Ordering::SeqCst);
        conn
    }

    #[tokio::test]
    async fn test_each_acquire_unwires_previous_handle() {
        let mut manager = SessionManager::new(alive());

        assert_eq!(manager.acquire_handle().await.unwrap().generation(), 1);
        assert_eq!(manager.acquire_handle().await.unwrap().generation(), 2);
        assert_eq!(manager.acquire_handle().await.unwrap().generation(), 3);
        manager.release().await;

        let conn = manager.connection();
        assert_eq!(*conn.wired.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(*conn.unwired.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(conn.reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dead_connection_is_reconnected() {
        let conn = FakeConnection::default();
        conn.reconnect_ok.store(true, Ordering::SeqCst);
        let mut manager = SessionManager::new(conn);

        let handle = manager.acquire_handle().await.unwrap();
        assert_eq!(handle.generation(), 1);
        assert_eq!(manager.connection().reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_reconnect_surfaces_error() {
        let mut manager = SessionManager::new(FakeConnection::default());

        let err = manager.acquire_handle().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Unreachable(_)));
        assert_eq!(manager.generation(), 0);
        assert!(manager.connection().wired.lock().unwrap().is_empty());
    }
}
