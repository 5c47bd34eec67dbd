use crate::backends::{PassthroughBackend, QueryEngine, RecordInterfaceClient};
use crate::config::AppConfig;
use crate::driver::{DriverAdapter, HttpDriver};
use crate::events::EventBus;
use crate::push::{self, ConnectionRegistry};
use crate::session::SessionRegistry;
use crate::workflow::{Orchestrator, WorkflowType};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

pub type ApiState = Arc<AppState>;

/// Application global state: the long-lived context objects constructed
/// once at process start. No module-level singletons.
pub struct AppState {
    pub config: RwLock<AppConfig>,
    pub bus: Arc<EventBus>,
    pub sessions: Arc<SessionRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub driver: Arc<dyn DriverAdapter>,
    pub query_engine: Arc<dyn QueryEngine>,
    pub record_interface: Arc<dyn RecordInterfaceClient>,
    manager: Arc<Orchestrator>,
    other: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Arc<Self> {
        let driver = Arc::new(HttpDriver::new(
            config.driver.endpoint.clone(),
            Duration::from_millis(config.driver.ready_timeout_ms),
        ));
        let backend = Arc::new(PassthroughBackend);
        let query_engine: Arc<dyn QueryEngine> = backend.clone();
        Self::with_collaborators(config, driver, query_engine, backend)
    }

    /// Construct with explicit collaborators; the seam tests use.
    pub fn with_collaborators(
        config: AppConfig,
        driver: Arc<dyn DriverAdapter>,
        query_engine: Arc<dyn QueryEngine>,
        record_interface: Arc<dyn RecordInterfaceClient>,
    ) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let sessions = Arc::new(SessionRegistry::new(
            Duration::from_millis(config.session.timeout_ms),
            Arc::clone(&bus),
        ));
        let connections = ConnectionRegistry::new(config.heartbeat.clone());
        // Registry-level bus subscription, set up once for the process.
        push::wire_bus(&bus, Arc::clone(&connections));

        // The driver is exclusively owned by whichever run holds this slot.
        let driver_slot = Arc::new(tokio::sync::Mutex::new(()));
        let manager = Orchestrator::new(
            WorkflowType::Manager,
            Arc::clone(&driver),
            Arc::clone(&driver_slot),
            Arc::clone(&bus),
            config.workflow.clone(),
        );
        let other = Orchestrator::new(
            WorkflowType::Other,
            Arc::clone(&driver),
            driver_slot,
            Arc::clone(&bus),
            config.workflow.clone(),
        );

        Arc::new(Self {
            config: RwLock::new(config),
            bus,
            sessions,
            connections,
            driver,
            query_engine,
            record_interface,
            manager,
            other,
        })
    }

    pub fn orchestrator(&self, kind: WorkflowType) -> &Arc<Orchestrator> {
        match kind {
            WorkflowType::Manager => &self.manager,
            WorkflowType::Other => &self.other,
        }
    }

    /// Start the background session sweep.
    pub fn spawn_background(&self) {
        let interval = Duration::from_millis(self.config.read().session.sweep_interval_ms);
        Arc::clone(&self.sessions).spawn_sweeper(interval);
    }

    /// Process teardown: tell every push client this is a shutdown, then
    /// drop all bus subscribers.
    pub fn shutdown(&self) {
        self.connections.close_all(push::CLOSE_SHUTDOWN, "shutdown");
        self.bus.shutdown();
    }
}
