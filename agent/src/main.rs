use clap::Parser;
use device_agent::config::{AgentConfig, Args};
use device_agent::device::SimulatedDevice;
use device_agent::metrics;
use device_agent::mqtt::MqttLink;
use device_agent::rest;
use device_agent::session::{AgentSession, SessionExit, SessionOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = AgentConfig::try_from(&args)?;

    info!("Starting device agent");
    info!(
        "Device: {}, hub: {}:{}, telemetry every {}s",
        config.connection.device_id,
        config.connection.host_name,
        config.mqtt_port,
        config.telemetry_interval
    );
    if config.ignores_shared_access_key() {
        warn!("SharedAccessKey is not used to sign tokens; pass --sas-token to authenticate");
    }

    metrics::init_metrics();

    let device = Arc::new(SimulatedDevice::new(args.firmware_version.clone()));
    let (link, eventloop) = MqttLink::new(&config);
    let link = Arc::new(link);

    let (tx, rx) = mpsc::channel(64);
    let eventloop_handle = link.spawn_event_loop(eventloop, tx, config.max_transport_errors);

    let session = AgentSession::create(
        SessionOptions {
            device_id: config.connection.device_id.clone(),
            telemetry_interval: config.telemetry_interval,
            fatal_report_errors: config.fatal_report_errors,
        },
        device,
        link,
    );

    if let Some(http_addr) = &args.http_addr {
        let app = rest::create_router(session.documents());
        let listener = tokio::net::TcpListener::bind(http_addr).await?;
        info!("HTTP server listening on {}", http_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("HTTP server error: {}", e);
            }
        });
    }

    if let Err(e) = session.start().await {
        error!("Session start failed: {}", e);
        session.stop().await;
        std::process::exit(1);
    }

    let exit = tokio::select! {
        exit = session.run(rx) => exit,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            session.stop().await;
            SessionExit::Shutdown
        }
    };

    // let queued responses and the disconnect go out
    if tokio::time::timeout(Duration::from_secs(2), eventloop_handle)
        .await
        .is_err()
    {
        warn!("MQTT event loop did not finish in time");
    }

    match exit {
        SessionExit::Shutdown => info!("Shutting down"),
        SessionExit::FirmwareUpdated => {
            info!("Firmware updated, exiting");
            std::process::exit(0);
        }
        SessionExit::TransportFailed => {
            warn!("Session ended after transport failure");
            std::process::exit(2);
        }
        SessionExit::ReportFailed => {
            error!("Session ended after reported-state failure");
            std::process::exit(3);
        }
    }

    Ok(())
}
