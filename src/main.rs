use clap::Parser;
use concierge::cli::Cli;
use concierge::config::{watcher::ConfigWatcher, Settings, SettingsHandle};
use concierge::mcp::default_factory;
use concierge::mcp::health::HealthMonitor;
use concierge::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let settings = Settings::new_with_cli(&cli)?;

    // Initialize tracing; RUST_LOG wins over the debug flag
    let default_level = if settings.server.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let host = settings.server.host.clone();
    let port = settings.server.port;
    info!("Starting Concierge on {}:{}", host, port);

    let settings = Arc::new(SettingsHandle::new(settings));
    let state = AppState::build(settings.clone(), default_factory())?;

    // Background probes for every enabled provider
    let monitor = Arc::new(HealthMonitor::new(
        state.registry.clone(),
        settings.current().settings.health.clone(),
        state.metrics.clone(),
    ));
    monitor.sync();
    info!(providers = monitor.running(), "Health monitor started");

    // Start config watcher
    let _watcher = if cli.no_watch {
        None
    } else {
        let runtime = tokio::runtime::Handle::current();
        let config_path = cli.config.clone();
        let reload_cli = cli.clone();
        let reload_settings = settings.clone();
        let registry = state.registry.clone();
        let reload_monitor = monitor.clone();
        let watcher = ConfigWatcher::new(vec![config_path], move || {
            // Probe tasks are spawned from the watcher thread
            let _guard = runtime.enter();
            match Settings::new_with_cli(&reload_cli) {
                Ok(new_settings) => {
                    let stale = reload_settings.current().settings.restart_required(&new_settings);
                    if !stale.is_empty() {
                        warn!(sections = ?stale, "Settings changed that only apply after a restart");
                    }
                    let generation = reload_settings.replace(new_settings);
                    let changes = registry.apply_generation(generation.settings.provider_configs());
                    reload_monitor.reconfigure(generation.settings.health.clone());
                    info!(
                        generation = generation.number,
                        added = changes.added.len(),
                        removed = changes.removed.len(),
                        "Configuration reloaded successfully"
                    );
                }
                // The previous generation stays active
                Err(e) => error!("Failed to reload configuration: {}", e),
            }
        });
        match watcher {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(error = %e, "Configuration watcher unavailable");
                None
            }
        }
    };

    // Create application using the library function
    let app = concierge::create_app(&state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    monitor.shutdown();
    Ok(())
}
