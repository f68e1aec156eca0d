//! CLI for RigBroker
//!
//! Subcommands:
//! - `serve`: run the broker (the default)
//! - `check-config`: load and validate the configuration, then exit
//! - `simulate`: play a device sequence against a running broker

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, QoS};
use tracing::{debug, error, info, warn};

use rigbroker::aggregator::AggregatorHandler;
use rigbroker::bridge;
use rigbroker::broker::Broker;
use rigbroker::config::{Settings, load_config_from};
use rigbroker::persistence::{RecordHandler, open_gateway};
use rigbroker::transport::{self, serve_tcp, serve_websocket};
use rigbroker::utils::error::ConfigurationError;
use rigbroker::utils::logging;

#[derive(Parser)]
#[command(name = "rigbroker", version, about = "MQTT broker for the conveyor rig")]
struct Cli {
    /// Configuration file; `config/default` is used when present otherwise
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the TCP and WebSocket listeners until Ctrl-C
    Serve,
    /// Validate the configuration and print the effective settings
    CheckConfig,
    /// Publish a device sequence to a broker (useful for smoke tests)
    Simulate {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 1883)]
        port: u16,
        /// Topic prefix of the raw device updates
        #[arg(long, default_value = "conveyor/raw")]
        prefix: String,
        /// Pause between two updates, in milliseconds
        #[arg(long, default_value_t = 200)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let settings = match load(cli.config.as_deref()) {
                Ok(settings) => settings,
                Err(code) => return code,
            };
            logging::init(&settings.logging.level);
            if let Err(e) = run_server(settings).await {
                error!("Server failed: {e}");
                return ExitCode::FAILURE;
            }
        }
        Command::CheckConfig => {
            let settings = match load(cli.config.as_deref()) {
                Ok(settings) => settings,
                Err(code) => return code,
            };
            println!("{settings:#?}");
        }
        Command::Simulate {
            host,
            port,
            prefix,
            interval_ms,
        } => {
            logging::init("info");
            let interval = Duration::from_millis(interval_ms);
            if let Err(e) = run_simulation(&host, port, &prefix, interval).await {
                error!("Simulation failed: {e}");
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}

fn load(path: Option<&str>) -> Result<Settings, ExitCode> {
    load_config_from(path).map_err(|e| {
        eprintln!("Configuration error: {e}");
        ExitCode::FAILURE
    })
}

async fn run_server(settings: Settings) -> Result<(), ConfigurationError> {
    let broker = Arc::new(Broker::with_settings(settings.broker.clone()));

    if settings.aggregator.enabled || !settings.persistence.routes.is_empty() {
        let gateway = open_gateway(&settings.persistence)?;
        if settings.aggregator.enabled {
            let handler = AggregatorHandler::from_settings(&settings.aggregator, gateway.clone())?;
            broker.register_handler(Arc::new(handler));
        }
        for route in &settings.persistence.routes {
            let handler = RecordHandler::from_route(route, gateway.clone())?;
            broker.register_handler(Arc::new(handler));
        }
    }

    let connector = if settings.bridge.enabled {
        Some(bridge::install(&settings.bridge, broker.clone())?)
    } else {
        info!("Bridge disabled");
        None
    };

    let tcp = transport::bind(&settings.server.tcp_addr()).await?;
    let ws = transport::bind(&settings.server.ws_addr()).await?;

    tokio::spawn(Broker::start_retry_loop(broker.clone()));
    if let Some(connector) = connector {
        tokio::spawn(connector.run());
    }

    tokio::select! {
        _ = serve_tcp(tcp, broker.clone()) => {
            error!("TCP listener exited unexpectedly.");
        }
        _ = serve_websocket(ws, broker.clone()) => {
            error!("WebSocket listener exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    Ok(())
}

/// One pass over the outer points: sensors are set for the workpiece, the
/// rig moves to the point, and the sensors clear again.
async fn run_simulation(
    host: &str,
    port: u16,
    prefix: &str,
    interval: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let client_id = format!("rigbroker-sim-{}", uuid::Uuid::new_v4().simple());
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(options, 32);

    let driver = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(event) => debug!("Simulator event: {event:?}"),
                Err(rumqttc::ConnectionError::RequestsDone) => break,
                Err(e) => {
                    warn!("Simulator connection ended: {e}");
                    break;
                }
            }
        }
    });

    for point in 1..=5u8 {
        // Odd points carry a metal workpiece, even ones a plastic one.
        let metallic = if point % 2 == 1 { "1" } else { "0" };
        let position = format!("O{point}");
        let steps = [
            ("ir_sensor", "1"),
            ("inductive_sensor", metallic),
            ("capacitive_sensor", "1"),
            ("point_id", position.as_str()),
            ("ir_sensor", "0"),
            ("inductive_sensor", "0"),
            ("capacitive_sensor", "0"),
        ];
        for (field, value) in steps {
            let topic = format!("{prefix}/{field}");
            info!("{topic} <- {value}");
            client
                .publish(topic, QoS::AtLeastOnce, false, value.to_string())
                .await?;
            tokio::time::sleep(interval).await;
        }
    }

    client.disconnect().await?;
    driver.await?;
    Ok(())
}
