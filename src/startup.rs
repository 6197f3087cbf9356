//! Application Startup
//!
//! Builds the routing core from settings, binds the listener and hands
//! everything to the [`LifecycleManager`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::application::hub::ConnectionHub;
use crate::application::presence::{presence_channel, PresenceReceiver, PresenceStore};
use crate::application::router::{build_router, LocalDelivery, MessageRouter};
use crate::config::{MessageMode, Settings};
use crate::domain::{GroupDirectory, InMemoryGroupDirectory};
use crate::infrastructure::bus::{BusBackend, MessageBusClient, RedisStreamBus};
use crate::infrastructure::cache::{self, KeyValueCache};
use crate::lifecycle::{Ingress, IngressGate, LifecycleComponents, LifecycleManager};
use crate::presentation::http::routes;
use crate::presentation::middleware::logging;
use crate::shared::error::{BusError, StartupError};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ConnectionHub>,
    pub router: Arc<dyn MessageRouter>,
    pub presence: Arc<PresenceStore>,
    /// Present in bus mode only
    pub bus: Option<Arc<MessageBusClient>>,
    pub gate: IngressGate,
    pub settings: Arc<Settings>,
}

/// External stores the core runs on.
pub struct Backends {
    pub cache: Arc<dyn KeyValueCache>,
    pub bus: Option<Arc<dyn BusBackend>>,
}

impl Backends {
    /// Connect to Redis for presence and, in bus mode, to the bus endpoint.
    pub async fn connect(settings: &Settings) -> Result<Self, StartupError> {
        let cache = cache::create_redis_cache(&settings.redis).await?;
        info!("Presence cache connection established");

        let bus: Option<Arc<dyn BusBackend>> = match settings.messaging.mode {
            MessageMode::Bus => {
                let backend = RedisStreamBus::connect(&settings.bus).await?;
                info!(url = %settings.bus.url, "Message bus connection established");
                Some(Arc::new(backend))
            }
            MessageMode::Channel => None,
        };

        Ok(Self {
            cache: Arc::new(cache),
            bus,
        })
    }
}

/// The wired routing core, not yet started.
pub struct Core {
    pub state: AppState,
    pub delivery: Arc<LocalDelivery>,
    presence_requests: PresenceReceiver,
}

impl Core {
    pub fn build(settings: Settings, backends: Backends) -> Result<Self, StartupError> {
        let settings = Arc::new(settings);
        let mode = settings.messaging.mode;

        let (presence_tx, presence_requests) = presence_channel();
        let hub = Arc::new(ConnectionHub::new(
            settings.bus.instance_id.clone(),
            settings.hub.queue_capacity,
            presence_tx,
        ));
        let presence = Arc::new(PresenceStore::new(backends.cache, &settings.presence));

        let directory: Arc<dyn GroupDirectory> =
            Arc::new(InMemoryGroupDirectory::from_map(settings.groups.clone()));
        let delivery = Arc::new(LocalDelivery::new(hub.clone(), directory));

        let bus = match mode {
            MessageMode::Bus => {
                let backend = backends
                    .bus
                    .ok_or_else(|| BusError::Unavailable("no bus backend configured".into()))?;
                Some(Arc::new(MessageBusClient::new(backend, settings.bus.clone())))
            }
            MessageMode::Channel => None,
        };
        let router = build_router(mode, delivery.clone(), bus.clone())?;
        info!(mode = %mode, instance_id = %hub.instance_id(), "Routing core assembled");

        Ok(Self {
            state: AppState {
                hub,
                router,
                presence,
                bus,
                gate: IngressGate::new(),
                settings,
            },
            delivery,
            presence_requests,
        })
    }

    pub fn into_lifecycle(self, ingress: Option<Ingress>) -> LifecycleManager {
        let shutdown_timeout = self.state.settings.shutdown.timeout();
        LifecycleManager::new(
            LifecycleComponents {
                hub: self.state.hub,
                presence: self.state.presence,
                presence_requests: self.presence_requests,
                delivery: self.delivery,
                bus: self.state.bus,
                gate: self.state.gate,
                ingress,
            },
            shutdown_timeout,
        )
    }
}

/// Application instance
pub struct Application {
    lifecycle: LifecycleManager,
    state: AppState,
    local_addr: SocketAddr,
}

impl Application {
    /// Build the application from settings
    pub async fn build(settings: Settings) -> Result<Self, StartupError> {
        let backends = Backends::connect(&settings).await?;
        Self::build_with(settings, backends).await
    }

    /// Build the application on top of already connected backends.
    pub async fn build_with(settings: Settings, backends: Backends) -> Result<Self, StartupError> {
        let core = Core::build(settings, backends)?;
        let state = core.state.clone();

        // Build router with middleware
        let app = routes::create_router(state.clone()).layer(logging::create_trace_layer());

        let listener = TcpListener::bind(state.settings.server_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {}", local_addr);

        let lifecycle = core.into_lifecycle(Some(Ingress { listener, app }));
        Ok(Self {
            lifecycle,
            state,
            local_addr,
        })
    }

    /// Run until SIGINT/SIGTERM, then shut down in order.
    pub async fn run_until_stopped(self) -> Result<(), StartupError> {
        self.lifecycle.run_until_signal().await
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
