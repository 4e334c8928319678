//! MQTT Agent - Main Entry Point

use clap::{Parser, Subcommand};
use mqtt_agent::config::AgentConfig;
use mqtt_agent::direct::DirectClient;
use mqtt_agent::dispatcher::{Agent, AgentHandle, CommandReply};
use mqtt_agent::observability::{init_default_logging, metrics};
use mqtt_agent::run::run_demo;
use mqtt_agent::supervisor::ConnectionSupervisor;
use mqtt_agent::transport::mqtt::RumqttcLink;
use mqtt_agent::transport::QoS;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// Resilient MQTT command agent
#[derive(Parser)]
#[command(name = "mqtt-agent")]
#[command(about = "Serialized multi-task access to one MQTT broker connection")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQTT_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent and drive the demo workload
    Run,
    /// Exercise the broker from a single task without the command queue
    Direct {
        /// Topic to subscribe, publish to and unsubscribe from
        #[arg(long, default_value = "mqtt-agent/direct")]
        topic: String,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 && std::env::var("LOG_LEVEL").is_err() {
        let level = if cli.verbose > 1 { "TRACE" } else { "DEBUG" };
        std::env::set_var("LOG_LEVEL", level);
    }
    init_default_logging();

    info!("Starting mqtt-agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_agent(config).await,
        Commands::Direct { topic } => run_direct(config, &topic).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    match result {
        Ok(true) => info!("Application shutdown complete"),
        Ok(false) => {
            warn!("Run did not meet its success policy");
            process::exit(1);
        }
        Err(e) => {
            error!("Command failed: {}", e);
            process::exit(1);
        }
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AgentConfig::load_from_file(path)?);
    }

    let default_paths = ["mqtt-agent.toml", "config/mqtt-agent.toml"];
    for path_str in default_paths {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(AgentConfig::load_from_file(&path)?);
        }
    }

    Err(
        "No configuration file found. Provide one with -c/--config or create mqtt-agent.toml"
            .into(),
    )
}

fn build_supervisor(config: &AgentConfig) -> ConnectionSupervisor<RumqttcLink> {
    let send_timeout = Duration::from_millis(config.retry.connect_ack_timeout_ms.max(1000));
    ConnectionSupervisor::new(RumqttcLink::new(send_timeout), config.supervisor_settings())
}

/// Start the agent, run the demo tasks and judge the outcome
async fn run_agent(config: AgentConfig) -> Result<bool, Box<dyn std::error::Error>> {
    let collector = metrics();
    collector.set_agent_state("initializing");

    let (mut agent, handle) = Agent::new(build_supervisor(&config), config.agent_settings());
    let session_present = agent.connect().await?;
    info!(session_present, "Connected to {}", config.endpoint());

    collector.set_agent_state("running");
    let mut agent_task = tokio::spawn(agent.run());

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    let demo = run_demo(&handle, &config.run);
    tokio::pin!(demo);

    let report = tokio::select! {
        report = &mut demo => Some(report),
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
            None
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
            None
        }
        finished = &mut agent_task => {
            collector.set_agent_state("error");
            return match finished {
                Ok(Ok(())) => Err("Agent stopped before the run finished".into()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(e.into()),
            };
        }
    };

    collector.set_agent_state("stopping");
    shutdown(&handle).await;
    match agent_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Agent ended with error: {}", e),
        Err(e) => warn!("Agent task failed: {}", e),
    }
    collector.set_agent_state("stopped");

    info!("Metrics: {}", serde_json::to_string(&collector.snapshot())?);

    let Some(report) = report else {
        return Ok(true);
    };
    let passed = report.passed(config.run.success_policy);
    info!(
        attempted = report.attempted,
        succeeded = report.succeeded,
        policy = ?config.run.success_policy,
        passed,
        "Demo run finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(passed)
}

async fn shutdown(handle: &AgentHandle) {
    match handle.terminate().await {
        Ok(done) => match done.await {
            Ok(Ok(CommandReply::Terminated)) => {}
            Ok(other) => warn!("Unexpected terminate outcome: {:?}", other),
            Err(_) => warn!("Agent exited before acknowledging terminate"),
        },
        Err(e) => warn!("Could not submit terminate: {}", e),
    }
}

/// Single-task round trip through the direct client
async fn run_direct(config: AgentConfig, topic: &str) -> Result<bool, Box<dyn std::error::Error>> {
    let mut client = DirectClient::new(
        build_supervisor(&config),
        config.packet_waiter(),
        config.direct_settings(),
    );

    let session_present = client.establish().await?;
    info!(session_present, "Direct session established");

    let granted = client.subscribe(topic, QoS::AtLeastOnce).await?;
    info!(topic, granted = granted.level(), "Subscribed");

    let packet_id = client.publish(topic, "hello from mqtt-agent").await?;
    info!(topic, packet_id, "Published");

    let wait = Duration::from_millis(config.run.receive_timeout_ms);
    let deadline = tokio::time::Instant::now() + wait;
    let mut received = false;
    while !received && tokio::time::Instant::now() < deadline {
        let messages = client
            .process(Duration::from_millis(config.waiter.per_poll_timeout_ms))
            .await?;
        received = messages.iter().any(|m| m.topic == topic);
    }

    client.unsubscribe(topic).await?;
    client.disconnect().await?;

    if received {
        info!(topic, "Round trip complete");
    } else {
        warn!(topic, "Published message did not come back within {:?}", wait);
    }
    Ok(received)
}

fn handle_config_command(
    config: AgentConfig,
    show: bool,
) -> Result<bool, Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(true)
}
