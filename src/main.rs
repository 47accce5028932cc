use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;

use ara_realtime_sync::config::Settings;
use ara_realtime_sync::events::{ChangeEvent, EntityType};
use ara_realtime_sync::metrics::encode_metrics;
use ara_realtime_sync::telemetry::init_tracing;
use ara_realtime_sync::transport::RedisTransport;
use ara_realtime_sync::{ConnectionManager, ConnectionState, Handlers};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    init_tracing(settings.watch.json_logs)?;
    tracing::info!("Configuration loaded");

    let entities = watched_entities(&settings.watch.entities)?;

    let transport = Arc::new(RedisTransport::new(settings.redis.clone())?);
    let manager = ConnectionManager::from_settings(transport, &settings)?;

    let tenant_id = settings.watch.tenant_id.clone();
    let handlers = Handlers::new()
        .on_entity_changes(entities.clone(), log_change)
        .on_presence_change(|roster| {
            let mut users: Vec<&str> = roster.keys().map(String::as_str).collect();
            users.sort_unstable();
            tracing::info!(online = roster.len(), users = ?users, "Presence changed");
        })
        .on_connection_state_change(|state| match state {
            ConnectionState::Error | ConnectionState::TimedOut => {
                tracing::warn!(state = %state, "Connection state changed")
            }
            _ => tracing::info!(state = %state, "Connection state changed"),
        });

    let handle = manager.subscribe(tenant_id.clone(), handlers);
    tracing::info!(tenant_id = %tenant_id, entities = ?entities, "Watching tenant");

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = handle.closed() => {
            tracing::error!(tenant_id = %tenant_id, "Subscription ended, exiting");
        }
    }

    manager.shutdown().await;

    if let Ok(metrics) = encode_metrics() {
        tracing::debug!(metrics = %metrics, "Final metrics");
    }

    tracing::info!("Watch shutdown complete");
    Ok(())
}

/// Configured entity names, or every entity type when none are given
fn watched_entities(names: &[String]) -> Result<Vec<EntityType>> {
    if names.is_empty() {
        return Ok(EntityType::ALL.to_vec());
    }

    names
        .iter()
        .map(|name| {
            name.trim()
                .parse::<EntityType>()
                .with_context(|| format!("Unknown entity type in WATCH__ENTITIES: {}", name))
        })
        .collect()
}

fn log_change(entity: EntityType, event: &ChangeEvent) {
    tracing::info!(
        entity = %entity,
        operation = event.operation().as_str(),
        id = event.field("id").as_deref().unwrap_or("-"),
        "Change received"
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
