use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use lytiva::config::BridgeConfig;
use lytiva::discovery::DiscoveryRegistry;
use lytiva::dispatch::Dispatcher;
use lytiva::engine::Engine;
use lytiva::state::EntityRegistry;
use lytiva::transport::MqttTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lytiva=debug")),
        )
        .init();

    tracing::info!("Starting Lytiva bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = BridgeConfig::from_env()?;
    let (transport, delivery) = MqttTransport::start(&config).await?;

    let entities = Arc::new(EntityRegistry::new(4096));
    let registry = Arc::new(DiscoveryRegistry::new(&config.discovery_prefix));

    let engine = Engine::new(
        transport.clone(),
        entities.clone(),
        config.template_engine.engine(),
        registry.clone(),
        Dispatcher::with_default_handlers(),
    );
    engine.install(&config)?;
    let handle = engine.handle();
    let engine_task = tokio::spawn(engine.run());

    let mut events = entities.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(
                    "{}: {} -> {}",
                    event.entity_id,
                    event
                        .old_state
                        .as_ref()
                        .map(|s| s.state.as_str())
                        .unwrap_or("none"),
                    event.new_state.state
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("State log lagged by {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    handle.shutdown();
    if let Err(e) = engine_task.await {
        tracing::error!("Engine task failed: {}", e);
    }
    tracing::info!(
        "{} discovery payloads, {} entities at shutdown",
        registry.len(),
        entities.len()
    );
    transport.disconnect();
    let _ = delivery.await;
    Ok(())
}
