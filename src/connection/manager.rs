//! Connection manager
//!
//! Retries connection attempts with exponential backoff, probes an existing
//! session with a short health check and releases it on close. Connect and
//! close never overlap: both run under one async operation lock.

use super::ConnectionState;
use crate::error_code::ErrorKind;
use crate::resilience::RetryPolicy;
use crate::telemetry::{noop_observer, Observer, RelayEvent};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Upper bound for a single health probe.
const MAX_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Establishes and probes sessions against one endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Live handle produced by a successful connect.
    type Session: Send + Sync + 'static;

    fn endpoint(&self) -> &str;

    async fn connect(&self) -> Result<Self::Session>;

    /// Lightweight probe; any error means the session is unusable.
    async fn health_check(&self, session: &Self::Session) -> Result<()>;

    async fn disconnect(&self, session: Arc<Self::Session>) -> Result<()> {
        drop(session);
        Ok(())
    }
}

/// Read-only view of a manager's state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub connection_attempts: u32,
    pub last_connection_time: Option<SystemTime>,
    pub endpoint: String,
}

struct Inner<S> {
    state: ConnectionState,
    session: Option<Arc<S>>,
    attempts: u32,
    last_connected: Option<SystemTime>,
}

/// Owns the connection state machine for one connector.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    policy: RetryPolicy,
    timeout: Duration,
    observer: Arc<dyn Observer>,
    op_lock: tokio::sync::Mutex<()>,
    inner: Mutex<Inner<C::Session>>,
}

/// Puts a half-finished `Connecting` back to `Disconnected` if the connect
/// future is dropped before it resolves.
struct ConnectingGuard<'a, S> {
    inner: &'a Mutex<Inner<S>>,
    armed: bool,
}

impl<S> Drop for ConnectingGuard<'_, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.state == ConnectionState::Connecting {
            inner.state = ConnectionState::Disconnected;
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// `timeout` bounds each connect attempt; health checks use half of it (at most 10s).
    pub fn new(connector: C, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            connector,
            policy,
            timeout,
            observer: noop_observer(),
            op_lock: tokio::sync::Mutex::new(()),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                session: None,
                attempts: 0,
                last_connected: None,
            }),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn endpoint(&self) -> &str {
        self.connector.endpoint()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn health_check_timeout(&self) -> Duration {
        (self.timeout / 2).min(MAX_HEALTH_CHECK_TIMEOUT)
    }

    fn inner(&self) -> MutexGuard<'_, Inner<C::Session>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Total attempts made over the manager's lifetime.
    pub fn connection_attempts(&self) -> u32 {
        self.inner().attempts
    }

    pub fn last_connection_time(&self) -> Option<SystemTime> {
        self.inner().last_connected
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let inner = self.inner();
        ConnectionSnapshot {
            state: inner.state,
            connection_attempts: inner.attempts,
            last_connection_time: inner.last_connected,
            endpoint: self.endpoint().to_string(),
        }
    }

    fn current_session(&self) -> Option<Arc<C::Session>> {
        let inner = self.inner();
        match inner.state {
            ConnectionState::Connected => inner.session.clone(),
            _ => None,
        }
    }

    /// Connect, retrying up to `max_retries` times.
    ///
    /// An existing session is released first. On exhaustion the manager is
    /// left `Disconnected` and the last error is returned.
    pub async fn connect_with_retry(&self) -> Result<Arc<C::Session>> {
        let _op = self.op_lock.lock().await;
        self.connect_locked().await
    }

    /// Return the live session, connecting first if needed.
    pub async fn ensure_connected(&self) -> Result<Arc<C::Session>> {
        if let Some(session) = self.current_session() {
            return Ok(session);
        }
        let _op = self.op_lock.lock().await;
        // Another caller may have connected while we waited for the lock.
        if let Some(session) = self.current_session() {
            return Ok(session);
        }
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> Result<Arc<C::Session>> {
        // Connected -> Disconnected first; Connecting is only entered from Disconnected.
        let previous = self.inner().session.clone();
        if let Some(old) = previous {
            self.release(&old).await;
        }
        self.inner().state = ConnectionState::Connecting;
        let mut guard = ConnectingGuard {
            inner: &self.inner,
            armed: true,
        };

        let max_attempts = self.policy.max_attempts();
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            {
                let mut inner = self.inner();
                inner.attempts = inner.attempts.saturating_add(1);
            }
            self.observer.observe(&RelayEvent::ConnectionAttempt {
                endpoint: self.endpoint().to_string(),
                attempt: attempt + 1,
                max_attempts,
            });
            debug!(
                endpoint = %self.endpoint(),
                attempt = attempt + 1,
                max_attempts,
                "Connection attempt"
            );

            let outcome = match tokio::time::timeout(self.timeout, self.connector.connect()).await
            {
                Ok(Ok(session)) => Ok(session),
                Ok(Err(e)) => Err(self.classify(e)),
                Err(_) => Err(Error::timeout(
                    format!("Connection timeout after {}s", self.timeout.as_secs_f64()),
                    Some(self.timeout),
                )),
            };

            match outcome {
                Ok(session) => {
                    let session = Arc::new(session);
                    {
                        let mut inner = self.inner();
                        inner.state = ConnectionState::Connected;
                        inner.session = Some(session.clone());
                        inner.last_connected = Some(SystemTime::now());
                    }
                    guard.armed = false;
                    let elapsed = started.elapsed();
                    self.observer.observe(&RelayEvent::ConnectionEstablished {
                        endpoint: self.endpoint().to_string(),
                        attempt: attempt + 1,
                        elapsed,
                    });
                    info!(
                        endpoint = %self.endpoint(),
                        attempt = attempt + 1,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Connected"
                    );
                    return Ok(session);
                }
                Err(err) => {
                    let retry = self.policy.should_retry(&err, attempt);
                    self.observer.observe(&RelayEvent::ConnectionFailed {
                        endpoint: self.endpoint().to_string(),
                        attempt: attempt + 1,
                        error_type: err.kind(),
                        message: err.message(),
                        terminal: !retry,
                    });
                    if !retry {
                        self.inner().state = ConnectionState::Disconnected;
                        guard.armed = false;
                        error!(
                            endpoint = %self.endpoint(),
                            attempts = attempt + 1,
                            error_type = err.kind().name(),
                            error = %err,
                            "Connection failed"
                        );
                        return Err(err);
                    }
                    let delay = self.policy.delay_for(&err, attempt);
                    warn!(
                        endpoint = %self.endpoint(),
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error_type = err.kind().name(),
                        error = %err,
                        "Connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Timeouts stay timeouts; every other failure counts as a connection error.
    fn classify(&self, err: Error) -> Error {
        match err.kind() {
            ErrorKind::Timeout | ErrorKind::Connection => err,
            _ => Error::connection_to(
                format!("Connection failed: {}", err.message()),
                self.endpoint(),
            ),
        }
    }

    /// Probe the current session. Never fails: any problem marks the
    /// connection `Disconnected` and yields `false`.
    pub async fn check_connection(&self) -> bool {
        let Some(session) = self.current_session() else {
            return false;
        };
        let probe_timeout = self.health_check_timeout();
        let started = Instant::now();
        let healthy =
            match tokio::time::timeout(probe_timeout, self.connector.health_check(&session)).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(endpoint = %self.endpoint(), error = %e, "Connection health check failed");
                    false
                }
                Err(_) => {
                    warn!(
                        endpoint = %self.endpoint(),
                        timeout_ms = probe_timeout.as_millis() as u64,
                        "Connection health check timed out"
                    );
                    false
                }
            };
        self.observer.observe(&RelayEvent::HealthCheck {
            endpoint: self.endpoint().to_string(),
            healthy,
            elapsed: started.elapsed(),
        });
        if !healthy {
            self.release(&session).await;
        }
        healthy
    }

    /// Reconnect when the health check fails.
    ///
    /// Returns `Ok(false)` when the existing session was healthy (nothing
    /// changes) and `Ok(true)` when a new session was established.
    pub async fn reconnect_if_needed(&self) -> Result<bool> {
        if self.check_connection().await {
            return Ok(false);
        }
        info!(endpoint = %self.endpoint(), "Connection lost, attempting to reconnect");
        self.ensure_connected().await.map(|_| true)
    }

    /// Drop `session` after a caller saw a transport failure on it. A newer
    /// session established in the meantime is left alone.
    pub async fn mark_unhealthy(&self, session: &Arc<C::Session>) {
        self.release(session).await;
    }

    async fn release(&self, session: &Arc<C::Session>) {
        let (taken, previous) = {
            let mut inner = self.inner();
            let current = inner
                .session
                .as_ref()
                .map(|s| Arc::ptr_eq(s, session))
                .unwrap_or(false);
            if !current {
                return;
            }
            let previous = inner.state;
            inner.state = ConnectionState::Disconnected;
            (inner.session.take(), previous)
        };
        self.observer.observe(&RelayEvent::Disconnected {
            endpoint: self.endpoint().to_string(),
            previous,
        });
        if let Some(s) = taken {
            if let Err(e) = self.connector.disconnect(s).await {
                warn!(endpoint = %self.endpoint(), error = %e, "Error during connection cleanup");
            }
        }
    }

    /// Idempotent. Always ends `Disconnected`; cleanup errors are logged only.
    pub async fn close_connection(&self) {
        let _op = self.op_lock.lock().await;
        let (taken, previous) = {
            let mut inner = self.inner();
            let previous = inner.state;
            inner.state = ConnectionState::Disconnected;
            (inner.session.take(), previous)
        };
        if let Some(s) = taken {
            match self.connector.disconnect(s).await {
                Ok(()) => info!(endpoint = %self.endpoint(), "Connection closed"),
                Err(e) => {
                    warn!(endpoint = %self.endpoint(), error = %e, "Error during connection cleanup")
                }
            }
        }
        if previous != ConnectionState::Disconnected {
            self.observer.observe(&RelayEvent::Disconnected {
                endpoint: self.endpoint().to_string(),
                previous,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::InMemoryObserver;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct Scripted {
        fail_first: u32,
        hang: bool,
        hang_from: Option<u32>,
        unhealthy: AtomicBool,
        fail_disconnect: bool,
        connects: AtomicU32,
        probes: AtomicU32,
        disconnects: AtomicU32,
    }

    #[async_trait]
    impl Connector for Scripted {
        type Session = u32;

        fn endpoint(&self) -> &str {
            "mock://scripted"
        }

        async fn connect(&self) -> Result<u32> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if self.hang || self.hang_from.map_or(false, |from| n >= from) {
                std::future::pending::<()>().await;
            }
            if n < self.fail_first {
                return Err(Error::connection("refused"));
            }
            Ok(n)
        }

        async fn health_check(&self, _session: &u32) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.unhealthy.load(Ordering::SeqCst) {
                return Err(Error::service("probe failed"));
            }
            Ok(())
        }

        async fn disconnect(&self, _session: Arc<u32>) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            if self.fail_disconnect {
                return Err(Error::connection("already gone"));
            }
            Ok(())
        }
    }

    fn manager(connector: Scripted, max_retries: u32) -> ConnectionManager<Scripted> {
        let policy = RetryPolicy::new()
            .with_max_retries(max_retries)
            .retry_on([ErrorKind::Connection, ErrorKind::Timeout]);
        ConnectionManager::new(connector, policy, Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_on_third_attempt() {
        let mgr = manager(
            Scripted {
                fail_first: 2,
                ..Default::default()
            },
            2,
        );
        let session = mgr.connect_with_retry().await.unwrap();
        assert_eq!(*session, 2);
        assert_eq!(mgr.connection_attempts(), 3);
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert!(mgr.last_connection_time().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error_after_backoff() {
        let obs = Arc::new(InMemoryObserver::default());
        let mgr = manager(
            Scripted {
                fail_first: u32::MAX,
                ..Default::default()
            },
            2,
        )
        .with_observer(obs.clone());

        let started = Instant::now();
        let err = mgr.connect_with_retry().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(mgr.connection_attempts(), 3);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        // 1s + 2s of backoff between the three attempts.
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(obs.count("connection_attempt"), 3);
        assert_eq!(obs.count("connection_failed"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_classified() {
        let mgr = manager(
            Scripted {
                hang: true,
                ..Default::default()
            },
            1,
        );
        let err = mgr.connect_with_retry().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("Connection timeout"));
        assert_eq!(mgr.connection_attempts(), 2);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_check_connection_without_session() {
        let mgr = manager(Scripted::default(), 0);
        assert!(!mgr.check_connection().await);
        assert_eq!(mgr.connector().probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_probe_disconnects() {
        let mgr = manager(Scripted::default(), 0);
        mgr.connect_with_retry().await.unwrap();
        mgr.connector().unhealthy.store(true, Ordering::SeqCst);
        assert!(!mgr.check_connection().await);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(mgr.connector().disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconnect_if_needed_healthy_is_noop() {
        let mgr = manager(Scripted::default(), 0);
        mgr.connect_with_retry().await.unwrap();
        assert!(!mgr.reconnect_if_needed().await.unwrap());
        assert_eq!(mgr.connection_attempts(), 1);
        assert_eq!(mgr.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_reconnect_if_needed_after_failure() {
        let mgr = manager(Scripted::default(), 0);
        mgr.connect_with_retry().await.unwrap();
        mgr.connector().unhealthy.store(true, Ordering::SeqCst);
        assert!(mgr.reconnect_if_needed().await.unwrap());
        assert_eq!(mgr.connection_attempts(), 2);
        assert!(mgr.is_connected());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_swallows_errors() {
        let mgr = manager(
            Scripted {
                fail_disconnect: true,
                ..Default::default()
            },
            0,
        );
        mgr.connect_with_retry().await.unwrap();
        mgr.close_connection().await;
        mgr.close_connection().await;
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(mgr.connector().disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mark_unhealthy_ignores_stale_session() {
        let mgr = manager(Scripted::default(), 0);
        let first = mgr.connect_with_retry().await.unwrap();
        let second = mgr.connect_with_retry().await.unwrap();
        mgr.mark_unhealthy(&first).await;
        assert!(mgr.is_connected());
        mgr.mark_unhealthy(&second).await;
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        let third = mgr.ensure_connected().await.unwrap();
        assert_eq!(*third, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_connect_does_not_stay_connecting() {
        let mgr = manager(
            Scripted {
                hang: true,
                ..Default::default()
            },
            0,
        );
        let _ = tokio::time::timeout(Duration::from_secs(1), mgr.connect_with_retry()).await;
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_passes_through_disconnected() {
        let obs = Arc::new(InMemoryObserver::default());
        let mgr = manager(Scripted::default(), 0).with_observer(obs.clone());
        mgr.connect_with_retry().await.unwrap();
        obs.clear();

        mgr.connect_with_retry().await.unwrap();
        let names: Vec<&str> = obs.events().iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            ["disconnected", "connection_attempt", "connection_established"]
        );
        assert!(matches!(
            obs.events()[0],
            RelayEvent::Disconnected {
                previous: ConnectionState::Connected,
                ..
            }
        ));
        assert_eq!(mgr.connector().disconnects.load(Ordering::SeqCst), 1);
        assert!(mgr.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_reconnect_reports_disconnect() {
        let obs = Arc::new(InMemoryObserver::default());
        let mgr = Arc::new(
            manager(
                Scripted {
                    hang_from: Some(1),
                    ..Default::default()
                },
                0,
            )
            .with_observer(obs.clone()),
        );
        mgr.connect_with_retry().await.unwrap();

        let task = tokio::spawn({
            let mgr = mgr.clone();
            async move { mgr.connect_with_retry().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(mgr.state(), ConnectionState::Connecting);
        assert_eq!(obs.count("disconnected"), 1);
        assert_eq!(mgr.connector().disconnects.load(Ordering::SeqCst), 1);
        task.abort();
    }

    #[test]
    fn test_health_timeout_is_capped() {
        let mgr = manager(Scripted::default(), 0);
        assert_eq!(mgr.health_check_timeout(), Duration::from_secs(10));
        let short = ConnectionManager::new(Scripted::default(), RetryPolicy::none(), Duration::from_secs(4));
        assert_eq!(short.health_check_timeout(), Duration::from_secs(2));
    }
}
