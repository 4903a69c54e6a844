//! mqtt-relay: Mirror MQTT topics into named variables and feedback states
//!
//! Loads an environment file, connects to the configured broker and keeps
//! the declared consumers registered across reconnects.

mod host;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mqtt_relay::Relay;
use mqtt_relay_metadata::Environment;
use mqtt_relay_middleware::{MiddlewareFactory, QoS};

use crate::host::Host;

#[derive(Parser, Debug)]
#[command(name = "mqtt-relay")]
#[command(about = "MQTT topic subscription and value relay")]
struct Args {
    /// Path to environment configuration file
    #[arg(short, long, env = "MQTT_RELAY_ENV")]
    env: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mirror the declared topics until interrupted (default)
    Run,
    /// Publish a single message and exit
    Publish {
        topic: String,
        payload: String,
        /// 0, 1 or 2
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
        #[arg(long)]
        retain: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let env = Environment::load(&args.env)
        .with_context(|| format!("loading {}", args.env.display()))?;
    info!(
        env = %env.name,
        url = %env.broker.url(),
        transport = ?env.transport,
        "Loaded environment configuration"
    );

    let transport = MiddlewareFactory::create_transport(&env);
    let options = MiddlewareFactory::connect_options(&env.broker);
    let (relay, events) = Relay::spawn(transport, options, &env.relay);

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            let host = Host::new(relay, &env)?;

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Received shutdown signal");
                shutdown_tx.send(true).ok();
            });

            host.run(events, shutdown_rx).await?;
        }
        Command::Publish {
            topic,
            payload,
            qos,
            retain,
        } => {
            let qos = QoS::try_from(qos)?;
            relay.publish(topic.as_str(), payload, qos, retain).await?;
            info!(topic = %topic, ?qos, retain, "Published message");
            relay.shutdown().await?;
        }
    }

    Ok(())
}
