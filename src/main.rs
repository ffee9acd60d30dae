use actix_web::{App, HttpServer, web};
use file_bridge_rs::agent::Agent;
use file_bridge_rs::api::{self, ApiState};
use file_bridge_rs::config::Settings;
use file_bridge_rs::context::BridgeContext;
use file_bridge_rs::telemetry;
use file_bridge_rs::venue::{PaperVenue, Venue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load environment variables
    dotenv::dotenv().ok();

    let settings = Settings::new()?;
    telemetry::init_tracing(&settings.logging)?;

    info!("╔═══════════════════════════════════════════════════════════════╗");
    info!("║                 FILE BRIDGE AGENT                             ║");
    info!("║        Terminal-side state publisher and trade executor       ║");
    info!("╚═══════════════════════════════════════════════════════════════╝");

    let files_dir = match settings.files_dir() {
        Ok(dir) => dir,
        Err(e) => {
            error!("❌ {}", e);
            std::process::exit(1);
        }
    };
    info!(dir = %files_dir.display(), "📁 Bridge directory");

    let ctx = BridgeContext::new_system();
    let paper = Arc::new(PaperVenue::new(ctx.clone(), &settings.paper));
    let venue: Arc<dyn Venue> = paper.clone();
    info!(venue = venue.name(), "✅ Venue initialized");

    let agent = Agent::new(ctx, venue, &files_dir, &settings);
    let api_state = ApiState {
        status: agent.status(),
        freshness: agent.writer().freshness().clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // --- Paper quote driver ---
    let mut walk_shutdown = shutdown_rx.clone();
    let walk_every = Duration::from_millis(settings.agent.timer_ms.max(100));
    let walk_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(walk_every);
        loop {
            tokio::select! {
                _ = interval.tick() => paper.random_walk(),
                changed = walk_shutdown.changed() => {
                    if changed.is_err() || *walk_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    let agent_handle = tokio::spawn(agent.run(shutdown_rx));

    // --- API Server Task ---
    let server_handle = match settings.agent.api_port {
        Some(port) => {
            let bind_address = format!("0.0.0.0:{}", port);
            info!("🚀 Starting API Server on {}", bind_address);
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(api_state.clone()))
                    .configure(api::config)
            })
            .bind(&bind_address)?
            .disable_signals()
            .run();
            let handle = server.handle();
            tokio::spawn(server);
            Some(handle)
        }
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    if shutdown_tx.send(true).is_err() {
        warn!("Agent loop already stopped");
    }
    if let Some(handle) = server_handle {
        handle.stop(true).await;
    }

    let _ = walk_handle.await;
    let _ = agent_handle.await;
    info!("👋 File bridge agent stopped");
    Ok(())
}
