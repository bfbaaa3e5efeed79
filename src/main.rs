use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use open_music_link::{Config, Coordinator, CoordinatorEvent, EventBus, NodeLink, Services};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_link=debug".parse()?)
                .add_directive("reqwest=info".parse()?)
                .add_directive("tungstenite=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Music Link v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    // Sin bot anfitrión: los comandos de voz solo se registran
    let gateway = |guild_id: u64, payload: Value| -> open_music_link::Result<()> {
        info!("📡 Gateway op para guild {}: {}", guild_id, payload);
        Ok(())
    };

    let coordinator = Coordinator::new(
        config.clone(),
        Services::new(&config.search_prefix),
        Arc::new(gateway),
    );
    coordinator.add_configured_nodes()?;

    info!("🎼 Conectando nodos...");
    let mut connected = 0;
    for (node, result) in coordinator.connect_all().await {
        match result {
            Ok(()) => connected += 1,
            Err(e) => error!("❌ Nodo {} no disponible: {}", node, e),
        }
    }
    if connected == 0 {
        warn!("⚠️ Ningún nodo conectó al inicio; se seguirá reintentando");
    }

    let mut events = coordinator.subscribe();
    info!("🚀 Coordinador iniciado ({} nodos)", coordinator.nodes().len());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("⚠️ Señal de shutdown recibida, cerrando...");
                break;
            }
            event = events.recv() => match event {
                Ok(CoordinatorEvent::RequestCompleted { .. }) => {}
                Ok(event) => debug!("{:?}", event),
                Err(RecvError::Lagged(missed)) => warn!("Se perdieron {} eventos", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }

    coordinator.shutdown().await;
    Ok(())
}

/// Asks every configured node for `/v4/info`.
async fn health_check(config: &Config) -> Result<()> {
    let mut healthy = true;

    for node in &config.nodes {
        let link = NodeLink::with_http(node.clone(), config.link_settings(), EventBus::default())?;
        match link.refresh_info().await {
            Ok(info) => println!("{}: OK ({})", node.name, info.version.semver),
            Err(e) => {
                println!("{}: FAIL ({})", node.name, e);
                healthy = false;
            }
        }
    }

    if healthy {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Nodos no disponibles");
    }
}
