//! The shared application context.
//!
//! Store, bus, scheduler and plan service are singletons constructed once at
//! startup and threaded through handlers as state; nothing reaches for them
//! as ambient globals.

use std::sync::Arc;

use conductor_core::bus::EventBus;
use conductor_core::plan::PlanService;
use conductor_core::scheduler::Scheduler;
use conductor_store::Store;

use crate::config::ServerConfig;

pub struct AppContext {
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub scheduler: Arc<Scheduler>,
    pub plan: Arc<PlanService>,
    pub config: Arc<ServerConfig>,
}

pub type Ctx = Arc<AppContext>;

/// Run blocking store/git work off the async runtime.
pub async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    tokio::task::spawn_blocking(f)
        .await
        .expect("blocking task panicked")
}
