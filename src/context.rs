use crate::config::PipelineConfig;
use crate::providers::Providers;
use std::sync::Arc;
use tgclient::TgClient;
use tgpulse_bus::{Coordinator, StreamBus};
use tgpulse_cas::Cas;
use tgpulse_db::{ConnectionPool, PoolError, PooledConnection};

/// Everything a supervised task needs, threaded explicitly from main. There
/// are no module-level singletons anywhere in this codebase; if a component
/// wants a dependency, it shows up here and is passed down.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<PipelineConfig>,
    pub pool: ConnectionPool,
    pub bus: StreamBus,
    pub coordinator: Coordinator,
    pub cas: Cas,
    pub tg: TgClient,
    pub providers: Arc<Providers>,
    /// Unique per process; used as the holder id for coordinator locks and
    /// as the consumer name prefix in stream groups.
    pub instance_id: String,
}

impl AppContext {
    pub fn conn(&self) -> Result<PooledConnection, PoolError> {
        self.pool.get()
    }
}
