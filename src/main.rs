//! Gateway Core binary: composition root wiring the store, router, queue
//! manager, heartbeat scheduler, and HTTP ingress into a running service.
//!
//! Agent business logic (medical decision rules, LLM prompt construction,
//! risk scoring) is an external collaborator; the stub agents registered
//! here only satisfy the [`diary_gateway::agent::Agent`] contract so the
//! binary is runnable end-to-end.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use diary_gateway::agent::{Agent, AgentRegistry};
use diary_gateway::agent_response::AgentResult;
use diary_gateway::channel::ChannelRegistry;
use diary_gateway::config::GatewayConfig;
use diary_gateway::diary::PatientDiary;
use diary_gateway::diary_store::SqliteDiaryStore;
use diary_gateway::domain_types::AgentName;
use diary_gateway::error::AgentError;
use diary_gateway::event::EventEnvelope;
use diary_gateway::heartbeat::HeartbeatScheduler;
use diary_gateway::queue::QueueManager;
use diary_gateway::rest_api::{self, AppState, RouterProcessor};
use diary_gateway::router::GatewayRouter;

/// Command-line flags for the Gateway binary.
#[derive(Debug, Parser)]
struct Cli {
    /// Use the production config preset instead of development.
    #[arg(long)]
    production: bool,

    /// Path to a JSON config file, overriding the preset entirely.
    #[arg(long)]
    config: Option<String>,
}

struct PassthroughAgent {
    name: &'static str,
}

#[async_trait::async_trait]
impl Agent for PassthroughAgent {
    async fn process(&self, _event: &EventEnvelope, diary: PatientDiary) -> Result<AgentResult, AgentError> {
        info!(agent = self.name, "passthrough agent invoked, no business logic wired");
        Ok(AgentResult::unchanged(diary))
    }
}

fn register_stub_agents(registry: &mut AgentRegistry) {
    for name in ["intake", "clinical", "booking", "monitoring", "gp_comms", "helper_manager", "error_handler"] {
        registry.register(
            AgentName::try_new(name).expect("static agent name is valid"),
            Arc::new(PassthroughAgent { name }),
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("diary_gateway=info".parse()?),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let config = if let Some(path) = &cli.config {
        GatewayConfig::load_from_file(path).with_context(|| format!("loading config from {path}"))?
    } else if cli.production {
        GatewayConfig::production()
    } else {
        GatewayConfig::development()
    };
    config.validate().context("validating gateway config")?;

    info!(database_path = %config.database_path, "starting gateway core");

    let store: Arc<dyn diary_gateway::diary_store::DiaryStore> =
        Arc::new(SqliteDiaryStore::connect(&config.database_path).await.context("connecting to diary store")?);

    let mut agents = AgentRegistry::default();
    register_stub_agents(&mut agents);

    let channels = ChannelRegistry::default();

    let router = GatewayRouter::new(config.clone(), store.clone(), agents, channels);

    let processor = Arc::new(RouterProcessor::new(router.clone()));
    let queue = QueueManager::new(processor, config.queue_idle_timeout());

    let heartbeat = HeartbeatScheduler::new(store.clone(), queue.clone(), config.heartbeat_tick());
    heartbeat.recover_on_startup().await;
    let heartbeat_handle = heartbeat.spawn();

    let state = AppState {
        queue: queue.clone(),
        router: router.clone(),
        store: store.clone(),
    };
    let app = rest_api::create_router(state);

    let listener = TcpListener::bind(&config.http_bind_address).await.context("binding HTTP ingress")?;
    info!(address = %config.http_bind_address, "gateway HTTP ingress listening");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await.context("serving HTTP ingress")?;

    heartbeat.shutdown();
    let _ = heartbeat_handle.await;
    queue.stop().await;
    router.drain_background_tasks().await;

    info!("gateway core shut down cleanly");
    Ok(())
}
