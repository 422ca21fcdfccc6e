use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use minaret_agent::api::{self, ApiState};
use minaret_agent::audio::AudioGuard;
use minaret_agent::schedule::{HttpScheduleSource, ScheduleEngine, ScheduleSource};
use minaret_agent::{Agent, AgentReporter, AgentState, Config, HealthMonitor, WifiManager, identity};
use minaret_core::DeviceStatus;
use minaret_link::{CoordinatorLink, LinkConfig};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "minaret-agent")]
#[command(about = "Minaret prayer device agent")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "minaret-agent.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "minaret_agent=info,minaret_link=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    // The one startup failure that is allowed to kill the process: a
    // device with no identity cannot report to anyone.
    let identity = identity::load_or_create(&config.device.identity_path)?;

    info!(
        device_id = %identity.device_id,
        http_addr = %config.server.http_addr,
        coordinator_addr = %config.coordinator.addr,
        "Starting minaret-agent"
    );

    let cancel = CancellationToken::new();
    let state = AgentState::new();

    let audio = AudioGuard::from_config(&config.audio);
    audio.initialize().await;

    // Connectivity before the link: if there is no upstream network, bring
    // up the provisioning access point so a technician can supply one.
    let wifi = WifiManager::new(config.wifi.clone());
    if wifi.is_connected().await {
        match wifi.connection_info().await {
            Some(connection) => info!(ssid = %connection.ssid, "WiFi already connected"),
            None => info!("Network already connected"),
        }
    } else {
        info!("No WiFi connection, starting provisioning access point");
        if let Err(e) = wifi.start_access_point().await {
            warn!(error = %e, "Could not start access point, continuing without it");
        }
    }

    let health = HealthMonitor::new(config.health.clone(), config.wifi.interface.clone());

    let reporter = Arc::new(AgentReporter {
        identity: identity.clone(),
        state: state.clone(),
        health: health.clone(),
    });
    let link_config = LinkConfig {
        coordinator_addr: config.coordinator.addr,
        connect_timeout: Duration::from_secs(config.coordinator.connect_timeout_secs),
        reconnect_delay: Duration::from_secs(config.coordinator.reconnect_delay_secs),
        heartbeat_interval: Duration::from_secs(config.coordinator.heartbeat_interval_secs),
    };
    let (link, link_events) = CoordinatorLink::new(link_config, reporter).start(cancel.clone());

    let health_events = health.start(&cancel);

    let source = config
        .coordinator
        .schedule_url
        .clone()
        .map(|url| Arc::new(HttpScheduleSource::new(url)) as Arc<dyn ScheduleSource>);
    let engine = Arc::new(ScheduleEngine::new(config.schedule.fallback_times, source));
    let firings = engine.start(&cancel)?;

    let agent = Agent {
        identity: identity.clone(),
        state: state.clone(),
        audio: audio.clone(),
        engine: Arc::clone(&engine),
        health: health.clone(),
        link,
    };

    state.set_status(DeviceStatus::Ready).await;
    agent.send_status_update().await;
    info!("minaret-agent fully initialized");

    let agent_cancel = cancel.clone();
    let agent_handle = tokio::spawn(async move {
        agent.run(firings, health_events, link_events, agent_cancel).await;
    });

    let api_state = Arc::new(ApiState {
        identity,
        state,
        audio,
        engine: Arc::clone(&engine),
        health: health.clone(),
        wifi,
    });
    let app = api::router(api_state);
    let listener = TcpListener::bind(config.server.http_addr).await?;
    info!(http_addr = %config.server.http_addr, "HTTP server listening");

    let cancel_for_http = cancel.clone();
    tokio::select! {
        result = axum::serve(listener, app).with_graceful_shutdown(async move {
            cancel_for_http.cancelled().await;
        }) => {
            if let Err(e) = result {
                error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server shut down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    // Whichever way the select ended, tear everything down before joining.
    cancel.cancel();
    engine.stop();
    health.stop();
    let _ = agent_handle.await;

    info!("minaret-agent shut down complete");
    Ok(())
}
