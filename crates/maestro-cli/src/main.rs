//! Maestro orchestration core: wires the configuration registry, state
//! store, dispatch bus, disciplines, and orchestrator, then runs until
//! SIGINT and performs the bounded-drain shutdown.

use maestro_bus::{DispatchBus, MemoryBus};
use maestro_config::{ConfigRegistry, PlatformSettings};
use maestro_core::MaestroResult;
use maestro_llm::{DefaultProviderFactory, ProviderFactory};
use maestro_orchestrator::{HealthConfig, Orchestrator, SchedulerService};
use maestro_pools::{AutonomousPool, CollaborativePool, ContinuousRunner, Discipline};
use maestro_state::{FileDurableStore, MemoryCache, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> MaestroResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = PlatformSettings::from_env();
    info!(
        config_dir = %settings.config_dir.display(),
        data_dir = %settings.data_dir.display(),
        hot_reload = settings.hot_reload,
        "Maestro starting"
    );

    let registry = Arc::new(ConfigRegistry::load(&settings.config_dir)?);
    if settings.hot_reload {
        registry.watch()?;
    }

    let store = Arc::new(StateStore::new(
        Arc::new(MemoryCache::new()),
        Arc::new(FileDurableStore::new(&settings.data_dir).await?),
    ));
    let bus: Arc<dyn DispatchBus> = Arc::new(MemoryBus::default());
    let providers: Arc<dyn ProviderFactory> = Arc::new(DefaultProviderFactory::new());

    let autonomous = Arc::new(AutonomousPool::new(
        Arc::clone(&bus),
        Arc::clone(&store),
        Arc::clone(&providers),
        Arc::clone(&registry),
    ));
    let collaborative = Arc::new(CollaborativePool::new(
        Arc::clone(&bus),
        Arc::clone(&store),
        Arc::clone(&providers),
        Arc::clone(&registry),
    ));
    let continuous = Arc::new(ContinuousRunner::new(
        Arc::clone(&bus),
        Arc::clone(&store),
        Arc::clone(&providers),
        Arc::clone(&registry),
    ));
    continuous.start();
    let scheduler = Arc::new(SchedulerService::new(
        Arc::clone(&bus),
        Arc::clone(&store),
        Arc::clone(&providers),
        Arc::clone(&registry),
    ));

    let orchestrator = Arc::new(
        Orchestrator::new(
            Arc::clone(&registry),
            bus,
            store,
            vec![
                autonomous as Arc<dyn Discipline>,
                collaborative as Arc<dyn Discipline>,
                continuous as Arc<dyn Discipline>,
                scheduler as Arc<dyn Discipline>,
            ],
        )
        .with_shutdown_timeout(Duration::from_secs(settings.shutdown_timeout_seconds))
        .with_health_config(HealthConfig {
            interval: Duration::from_secs(settings.health_interval_seconds),
            ..HealthConfig::default()
        }),
    );
    orchestrator.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");
    orchestrator.shutdown().await;
    Ok(())
}
