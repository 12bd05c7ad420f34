//! Composition root: wires stores, writer, orchestrator and bus, and owns
//! the background tasks.

use std::sync::Arc;

use anyhow::Context;
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{info, warn};

#[cfg(feature = "http-gateway")]
use crate::{
    clock::SystemClock,
    dao::gateway::http::{HttpGateway, HttpGatewayConfig},
};
use crate::{
    clock::Clock,
    config::CoreConfig,
    dao::gateway::SharedGateway,
    platform::PlatformClient,
    services::{
        bus::{EventBus, PlatformEvent},
        orchestrator::{SessionOrchestrator, SharedOrchestrator},
        writer::{DeferredWriter, WriterStats},
    },
    state::LifecycleEvent,
};

/// Running core. Dropping it leaves the background tasks running; call
/// [`Runtime::shutdown`] to stop them.
pub struct Runtime {
    orchestrator: SharedOrchestrator,
    bus: Arc<EventBus>,
    writer: DeferredWriter,
    ticker: JoinHandle<()>,
}

impl Runtime {
    /// Connect to the configured REST stores and start the core.
    #[cfg(feature = "http-gateway")]
    pub async fn start(config: CoreConfig, platform: Arc<dyn PlatformClient>) -> anyhow::Result<Self> {
        let primary_config = match config.gateway.primary.clone() {
            Some(primary) => primary,
            None => HttpGatewayConfig::from_env().context("resolving primary store endpoint")?,
        };
        let primary: SharedGateway = Arc::new(
            HttpGateway::connect(primary_config).context("building primary store client")?,
        );

        let mut secondaries: Vec<SharedGateway> = Vec::new();
        for replica in config.gateway.secondaries.iter().cloned() {
            let name = replica.name.clone();
            let gateway = HttpGateway::connect(replica)
                .with_context(|| format!("building replica client `{name}`"))?;
            secondaries.push(Arc::new(gateway));
        }

        let clock = Arc::new(SystemClock::new(config.utc_offset_hours));
        Self::with_gateways(config, platform, primary, secondaries, clock).await
    }

    /// Start the core against already-built stores.
    ///
    /// Checks the primary, runs a first reconciliation, then spawns the
    /// replication loop and the periodic reconciliation ticker.
    pub async fn with_gateways(
        config: CoreConfig,
        platform: Arc<dyn PlatformClient>,
        primary: SharedGateway,
        secondaries: Vec<SharedGateway>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        primary
            .health_check()
            .await
            .with_context(|| format!("primary store `{}` is unreachable", primary.name()))?;

        let replicas = secondaries.len();
        let writer = DeferredWriter::new(primary, secondaries, config.writer);
        writer.start();

        let orchestrator: SharedOrchestrator = Arc::new(SessionOrchestrator::new(
            &config,
            platform,
            writer.clone(),
            clock,
        ));
        let bus = Arc::new(EventBus::with_orchestrator(orchestrator.clone()));

        match orchestrator.reconcile().await {
            Ok(report) => info!(?report, "startup reconciliation finished"),
            Err(err) => warn!(error = %err, "startup reconciliation failed; retrying on next tick"),
        }

        let ticker = tokio::spawn(run_reconciliation_ticker(
            bus.clone(),
            config.reconciliation_interval,
        ));

        info!(
            create_channel = %config.create_channel_id,
            replicas,
            "room core started"
        );
        Ok(Self {
            orchestrator,
            bus,
            writer,
            ticker,
        })
    }

    /// Feed a platform event through the bus. Returns the number of failed handlers.
    pub async fn dispatch(&self, event: PlatformEvent) -> usize {
        self.bus.dispatch(&event).await
    }

    /// The orchestrator, for direct commands such as renames.
    pub fn orchestrator(&self) -> &SharedOrchestrator {
        &self.orchestrator
    }

    /// Subscribe to lifecycle notifications.
    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.orchestrator.subscribe()
    }

    /// Replication counters.
    pub fn writer_stats(&self) -> WriterStats {
        self.writer.stats()
    }

    /// Stop the ticker and the replication loop. Pending replications are lost.
    pub fn shutdown(&self) {
        self.ticker.abort();
        self.writer.shutdown();
        info!("room core stopped");
    }
}

async fn run_reconciliation_ticker(bus: Arc<EventBus>, period: std::time::Duration) {
    let mut ticks = interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; startup already reconciled.
    ticks.tick().await;
    loop {
        ticks.tick().await;
        bus.dispatch(&PlatformEvent::ReconciliationTick).await;
    }
}
