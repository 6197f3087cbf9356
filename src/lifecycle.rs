//! Process Lifecycle
//!
//! Startup ordering, the termination signal, and ordered best-effort
//! shutdown.
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Stopped
//! ```
//!
//! Shutdown steps, each bounded by the shutdown timeout and each run even
//! when an earlier one failed:
//!
//! 1. close the ingress gate (no new connections, sessions stop reading)
//! 2. close the bus client
//! 3. shut the hub down and let the presence worker drain
//! 4. purge the presence namespace
//! 5. wait for the HTTP server to finish

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::application::hub::ConnectionHub;
use crate::application::presence::{PresenceReceiver, PresenceStore, PresenceSync};
use crate::application::router::LocalDelivery;
use crate::infrastructure::bus::MessageBusClient;
use crate::shared::error::StartupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Stopping,
    /// Terminal
    Stopped,
}

/// Shared open/closed switch for ingress.
///
/// The HTTP server and every session watch it; closing it stops new
/// upgrades and ends session read loops.
#[derive(Debug, Clone)]
pub struct IngressGate {
    tx: Arc<watch::Sender<bool>>,
}

impl IngressGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(true);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn close(&self) {
        self.tx.send_replace(false);
    }

    /// Resolves once the gate is closed.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|open| !*open).await;
    }
}

impl Default for IngressGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Bound listener plus the router it will serve.
pub struct Ingress {
    pub listener: TcpListener,
    pub app: Router,
}

/// Everything the lifecycle starts and stops.
pub struct LifecycleComponents {
    pub hub: Arc<ConnectionHub>,
    pub presence: Arc<PresenceStore>,
    pub presence_requests: PresenceReceiver,
    pub delivery: Arc<LocalDelivery>,
    pub bus: Option<Arc<MessageBusClient>>,
    pub gate: IngressGate,
    pub ingress: Option<Ingress>,
}

#[derive(Default)]
struct Tasks {
    presence_requests: Option<PresenceReceiver>,
    ingress: Option<Ingress>,
    presence_worker: Option<JoinHandle<()>>,
    server: Option<JoinHandle<io::Result<()>>>,
}

pub struct LifecycleManager {
    state: Mutex<LifecycleState>,
    hub: Arc<ConnectionHub>,
    presence: Arc<PresenceStore>,
    delivery: Arc<LocalDelivery>,
    bus: Option<Arc<MessageBusClient>>,
    gate: IngressGate,
    shutdown_timeout: Duration,
    tasks: AsyncMutex<Tasks>,
}

impl LifecycleManager {
    pub fn new(components: LifecycleComponents, shutdown_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(LifecycleState::Idle),
            hub: components.hub,
            presence: components.presence,
            delivery: components.delivery,
            bus: components.bus,
            gate: components.gate,
            shutdown_timeout,
            tasks: AsyncMutex::new(Tasks {
                presence_requests: Some(components.presence_requests),
                ingress: components.ingress,
                ..Tasks::default()
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    fn set_state(&self, next: LifecycleState) {
        let mut state = self.state.lock();
        info!(from = ?*state, to = ?next, "Lifecycle state change");
        *state = next;
    }

    /// Start the bus client, the presence worker and the HTTP server.
    ///
    /// A bus that cannot be reached is fatal and leaves the manager `Stopped`.
    pub async fn start(&self) -> Result<(), StartupError> {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Idle {
                return Err(StartupError::InvalidState(*state));
            }
            *state = LifecycleState::Starting;
        }

        if let Some(bus) = &self.bus {
            if let Err(e) = bus.start(self.delivery.clone()).await {
                error!(error = %e, "Message bus failed to start");
                self.gate.close();
                self.hub.shutdown();
                // A concurrent stop already owns the transition
                let _ = self.leave_starting(LifecycleState::Stopped);
                return Err(e);
            }
        }

        let mut tasks = self.tasks.lock().await;
        let current = self.state();
        if current != LifecycleState::Starting {
            warn!(state = ?current, "Stopped while starting");
            return Err(StartupError::InvalidState(current));
        }
        if let Some(requests) = tasks.presence_requests.take() {
            tasks.presence_worker = Some(PresenceSync::new(self.presence.clone(), requests).spawn());
        }

        if let Some(Ingress { listener, app }) = tasks.ingress.take() {
            let gate = self.gate.clone();
            if let Ok(addr) = listener.local_addr() {
                info!(%addr, "Accepting connections");
            }
            tasks.server = Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { gate.closed().await })
                    .await
            }));
        }
        // Still holding `tasks`: a stop racing us tears down what was just spawned
        self.leave_starting(LifecycleState::Running)
    }

    fn leave_starting(&self, next: LifecycleState) -> Result<(), StartupError> {
        let mut state = self.state.lock();
        if *state != LifecycleState::Starting {
            return Err(StartupError::InvalidState(*state));
        }
        info!(from = ?*state, to = ?next, "Lifecycle state change");
        *state = next;
        Ok(())
    }

    /// Start, wait for SIGINT/SIGTERM, then stop.
    pub async fn run_until_signal(&self) -> Result<(), StartupError> {
        self.run_until(shutdown_signal()).await
    }

    /// Start, wait for `signal`, then stop.
    pub async fn run_until<F>(&self, signal: F) -> Result<(), StartupError>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        self.stop().await;
        Ok(())
    }

    /// Ordered shutdown. Runs at most once; later calls return immediately.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                LifecycleState::Stopping | LifecycleState::Stopped => return,
                LifecycleState::Idle => {
                    *state = LifecycleState::Stopped;
                    return;
                }
                LifecycleState::Starting | LifecycleState::Running => {
                    *state = LifecycleState::Stopping;
                }
            }
        }
        info!("Shutting down");
        let limit = self.shutdown_timeout;
        let mut tasks = self.tasks.lock().await;

        // 1. ingress
        self.gate.close();
        info!("Ingress closed");

        // 2. bus
        if let Some(bus) = &self.bus {
            match bus.close(limit).await {
                Ok(()) => info!("Message bus closed"),
                Err(e) => warn!(error = %e, "Message bus close failed"),
            }
        }

        // 3. hub and presence worker
        let closed = self.hub.shutdown();
        info!(connections = closed, "Connections closed");
        if let Some(mut worker) = tasks.presence_worker.take() {
            if timeout(limit, &mut worker).await.is_err() {
                worker.abort();
                warn!(timeout = ?limit, "Presence worker did not drain in time");
            }
        }

        // 4. presence namespace
        match timeout(limit, self.presence.purge()).await {
            Ok(Ok(deleted)) => info!(deleted, "Presence purged"),
            Ok(Err(e)) => warn!(error = %e, "Presence purge failed"),
            Err(_) => warn!(timeout = ?limit, "Presence purge timed out"),
        }

        // 5. HTTP server
        if let Some(mut server) = tasks.server.take() {
            match timeout(limit, &mut server).await {
                Ok(Ok(Ok(()))) => info!("HTTP server stopped"),
                Ok(Ok(Err(e))) => warn!(error = %e, "HTTP server ended with error"),
                Ok(Err(e)) => warn!(error = %e, "HTTP server task failed"),
                Err(_) => {
                    server.abort();
                    warn!(timeout = ?limit, "HTTP server did not stop in time");
                }
            }
        }
        drop(tasks);

        self.set_state(LifecycleState::Stopped);
        info!("Shutdown complete");
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("state", &self.state())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

/// Resolves on SIGINT or SIGTERM (Ctrl-C on other platforms).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT - initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM - initiating graceful shutdown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusSettings, PresenceSettings, StartFrom};
    use crate::application::presence::presence_channel;
    use crate::domain::InMemoryGroupDirectory;
    use crate::infrastructure::bus::{BusBackend, BusRecord, MemoryBus, ReadCursor, ReadRequest};
    use crate::infrastructure::cache::{KeyValueCache, MemoryCache};
    use crate::shared::error::BusError;
    use async_trait::async_trait;

    /// Memory bus whose close always fails.
    struct FailingCloseBus(MemoryBus);

    #[async_trait]
    impl BusBackend for FailingCloseBus {
        async fn ping(&self) -> Result<(), BusError> {
            self.0.ping().await
        }
        async fn append(&self, stream: &str, payload: &[u8]) -> Result<String, BusError> {
            self.0.append(stream, payload).await
        }
        async fn ensure_group(&self, stream: &str, group: &str, start: StartFrom) -> Result<(), BusError> {
            self.0.ensure_group(stream, group, start).await
        }
        async fn read_group(&self, request: &ReadRequest, cursor: ReadCursor) -> Result<Vec<BusRecord>, BusError> {
            self.0.read_group(request, cursor).await
        }
        async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), BusError> {
            self.0.ack(stream, group, ids).await
        }
        async fn remove_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
            self.0.remove_group(stream, group).await
        }
        async fn close(&self) -> Result<(), BusError> {
            Err(BusError::Unavailable("close refused".into()))
        }
    }

    /// Bus that is never reachable.
    struct UnreachableBus;

    #[async_trait]
    impl BusBackend for UnreachableBus {
        async fn ping(&self) -> Result<(), BusError> {
            Err(BusError::Unavailable("connection refused".into()))
        }
        async fn append(&self, _: &str, _: &[u8]) -> Result<String, BusError> {
            Err(BusError::Closed)
        }
        async fn ensure_group(&self, _: &str, _: &str, _: StartFrom) -> Result<(), BusError> {
            Err(BusError::Closed)
        }
        async fn read_group(&self, _: &ReadRequest, _: ReadCursor) -> Result<Vec<BusRecord>, BusError> {
            Err(BusError::Closed)
        }
        async fn ack(&self, _: &str, _: &str, _: &[String]) -> Result<(), BusError> {
            Err(BusError::Closed)
        }
        async fn remove_group(&self, _: &str, _: &str) -> Result<(), BusError> {
            Err(BusError::Closed)
        }
        async fn close(&self) -> Result<(), BusError> {
            Ok(())
        }
    }

    fn bus_settings() -> BusSettings {
        BusSettings {
            url: "memory://".into(),
            login_topic: "login".into(),
            logout_topic: "logout".into(),
            chat_topic: "chat".into(),
            partitions: 1,
            timeout_ms: 500,
            consumer_group: "relay".into(),
            instance_id: "a".into(),
            start_from: StartFrom::Earliest,
            replay_window_secs: 0,
            remove_group_on_close: false,
            publish_attempts: 1,
            retry_backoff_ms: 1,
            publish_buffer: 8,
            read_batch: 8,
            poll_interval_ms: 5,
            max_len: 100,
            connect_attempts: 2,
            connect_backoff_ms: 1,
            dial_timeout_ms: 50,
        }
    }

    fn manager(cache: Arc<MemoryCache>, bus: Option<Arc<dyn BusBackend>>) -> (LifecycleManager, Arc<ConnectionHub>) {
        let (tx, rx) = presence_channel();
        let hub = Arc::new(ConnectionHub::new("a", 8, tx));
        let presence = Arc::new(PresenceStore::new(
            cache,
            &PresenceSettings {
                key_prefix: "presence:".into(),
                ttl_secs: 60,
            },
        ));
        let delivery = Arc::new(LocalDelivery::new(hub.clone(), Arc::new(InMemoryGroupDirectory::new())));
        let components = LifecycleComponents {
            hub: hub.clone(),
            presence,
            presence_requests: rx,
            delivery,
            bus: bus.map(|backend| Arc::new(MessageBusClient::new(backend, bus_settings()))),
            gate: IngressGate::new(),
            ingress: None,
        };
        (LifecycleManager::new(components, Duration::from_secs(1)), hub)
    }

    #[tokio::test]
    async fn test_gate_closes_once() {
        let gate = IngressGate::new();
        assert!(gate.is_open());

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.closed().await }
        });
        gate.close();
        gate.close();

        waiter.await.unwrap();
        assert!(!gate.is_open());
        // Already closed resolves immediately
        gate.closed().await;
    }

    #[tokio::test]
    async fn test_start_stop_transitions() {
        let (manager, _hub) = manager(Arc::new(MemoryCache::new()), Some(Arc::new(MemoryBus::new())));
        assert_eq!(manager.state(), LifecycleState::Idle);

        manager.start().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Running);
        assert!(matches!(
            manager.start().await,
            Err(StartupError::InvalidState(LifecycleState::Running))
        ));

        manager.stop().await;
        assert_eq!(manager.state(), LifecycleState::Stopped);
        manager.stop().await;
        assert_eq!(manager.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_purges_presence_even_when_bus_close_fails() {
        let cache = Arc::new(MemoryCache::new());
        let (manager, hub) = manager(
            cache.clone(),
            Some(Arc::new(FailingCloseBus(MemoryBus::new()))),
        );
        manager.start().await.unwrap();

        let _a = hub.register("U1").unwrap();
        let _b = hub.register("U2").unwrap();
        // Left behind by an earlier crash
        cache.set_ex("presence:ghost", "{}", 60).await.unwrap();
        cache.set_ex("unrelated", "keep", 60).await.unwrap();

        manager.stop().await;

        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert!(hub.is_closed());
        assert!(cache.scan_match("presence:*").await.unwrap().is_empty());
        assert_eq!(cache.get("unrelated").await.unwrap(), Some("keep".to_string()));
    }

    #[tokio::test]
    async fn test_unreachable_bus_is_fatal() {
        let (manager, hub) = manager(Arc::new(MemoryCache::new()), Some(Arc::new(UnreachableBus)));

        let err = manager.start().await.unwrap_err();
        assert!(matches!(
            err,
            StartupError::Unreachable { dependency: "message bus", attempts: 2, .. }
        ));
        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert!(hub.is_closed());
    }

    #[tokio::test]
    async fn test_stop_during_start_wins() {
        let (manager, hub) = manager(Arc::new(MemoryCache::new()), None);
        let manager = Arc::new(manager);

        // Park start right before it spawns anything
        let held = manager.tasks.lock().await;
        let starting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.start().await }
        });
        while manager.state() != LifecycleState::Starting {
            tokio::task::yield_now().await;
        }
        let stopping = tokio::spawn({
            let manager = manager.clone();
            async move { manager.stop().await }
        });
        while manager.state() != LifecycleState::Stopping {
            tokio::task::yield_now().await;
        }
        drop(held);

        assert!(matches!(
            starting.await.unwrap(),
            Err(StartupError::InvalidState(LifecycleState::Stopping))
        ));
        stopping.await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert!(hub.is_closed());
        assert!(manager.tasks.lock().await.presence_worker.is_none());
    }

    #[tokio::test]
    async fn test_run_until_stops_on_signal() {
        let (manager, hub) = manager(Arc::new(MemoryCache::new()), None);

        manager.run_until(async {}).await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert!(hub.is_closed());
    }
}
