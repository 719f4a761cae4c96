//! Tunnelgate CLI - expose a private HTTP service through a public relay
//!
//! `tunnelgate relay` runs the public gateway and the relay port.
//! `tunnelgate agent` runs next to the private service and keeps a tunnel open.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunnelgate_lib::{AgentConfig, GatewayConfig, RelayBuilder, TunnelAgent, TunnelId};

const LONG_VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (commit ",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Tunnelgate - expose private HTTP services through a public relay
#[derive(Parser, Debug)]
#[command(name = "tunnelgate")]
#[command(about = "Tunnelgate - expose private HTTP services through a public relay")]
#[command(version = env!("GIT_TAG"), long_version = LONG_VERSION)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', global = true, env = "TUNNELGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay: public HTTP gateway plus the port agents register on
    #[command(long_about = r#"
Run the relay server. Public requests to http://<host>/<tunnel-id>/<path>
are forwarded to the agent registered as <tunnel-id>, with the path
rewritten to /<path>.

EXAMPLES:
  # Defaults: public port 80, relay port 9000
  tunnelgate relay

  # Custom ports
  tunnelgate relay --public-addr 0.0.0.0:8080 --relay-addr 0.0.0.0:9001

  # From a config file
  tunnelgate --config tunnelgate.yaml relay

ENVIRONMENT VARIABLES:
  TUNNELGATE_PUBLIC_ADDR   Public HTTP bind address
  TUNNELGATE_RELAY_ADDR    Relay bind address
  TUNNELGATE_IDLE_TIMEOUT  Seconds of inactivity before a tunnel is evicted
"#)]
    Relay {
        /// Public HTTP bind address (e.g., 0.0.0.0:80)
        #[arg(long, env = "TUNNELGATE_PUBLIC_ADDR")]
        public_addr: Option<String>,

        /// Relay bind address agents connect to (e.g., 0.0.0.0:9000)
        #[arg(long, env = "TUNNELGATE_RELAY_ADDR")]
        relay_addr: Option<String>,

        /// Seconds a tunnel may stay idle before it is evicted
        #[arg(long, env = "TUNNELGATE_IDLE_TIMEOUT")]
        idle_timeout: Option<u64>,

        /// Seconds between liveness sweeps
        #[arg(long, env = "TUNNELGATE_SWEEP_INTERVAL")]
        sweep_interval: Option<u64>,

        /// Seconds a tunnel has to answer a forwarded request
        #[arg(long, env = "TUNNELGATE_RELAY_TIMEOUT")]
        relay_timeout: Option<u64>,
    },

    /// Run an agent that exposes a local service through the relay
    #[command(long_about = r#"
Connect to a relay and expose a local HTTP service under a tunnel ID.
Reconnects automatically if the relay connection drops.

EXAMPLES:
  # Expose localhost:3000 as http://relay.example.com/myapp/
  tunnelgate agent --tunnel-id myapp \
    --relay relay.example.com:9000 \
    --local 127.0.0.1:3000

ENVIRONMENT VARIABLES:
  TUNNELGATE_TUNNEL_ID  Tunnel identifier
  TUNNELGATE_RELAY      Relay address (host:port)
  TUNNELGATE_LOCAL      Local service address (host:port)
"#)]
    Agent {
        /// Tunnel identifier (letters, digits, '-', '_', '.', '~')
        #[arg(long, env = "TUNNELGATE_TUNNEL_ID")]
        tunnel_id: Option<String>,

        /// Relay address (e.g., relay.example.com:9000)
        #[arg(long, env = "TUNNELGATE_RELAY")]
        relay: Option<String>,

        /// Local service address (e.g., 127.0.0.1:3000)
        #[arg(long, env = "TUNNELGATE_LOCAL")]
        local: Option<String>,

        /// Seconds to wait before reconnecting
        #[arg(long, env = "TUNNELGATE_RECONNECT_DELAY")]
        reconnect_delay: Option<u64>,
    },
}

/// Configuration file format
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    relay: GatewayConfig,
    agent: AgentConfigFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AgentConfigFile {
    tunnel_id: Option<String>,
    relay: Option<String>,
    local: Option<String>,
    reconnect_delay: Option<u64>,
    heartbeat_interval: Option<u64>,
    connect_timeout: Option<u64>,
    local_timeout: Option<u64>,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Validate address format (should be host:port)
fn validate_address(addr: &str, addr_type: &str) -> Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        anyhow::bail!(
            "Invalid {} address format: '{}' (expected format: host:port)",
            addr_type,
            addr
        );
    };

    if host.is_empty() {
        anyhow::bail!(
            "Invalid {} address format: '{}' (host cannot be empty)",
            addr_type,
            addr
        );
    }

    port.parse::<u16>()
        .with_context(|| format!("Invalid port in {} address: {}", addr_type, addr))?;

    Ok(())
}

/// Merge CLI args over the config file's relay section
fn build_relay_builder(
    file: GatewayConfig,
    public_addr: Option<String>,
    relay_addr: Option<String>,
    idle_timeout: Option<u64>,
    sweep_interval: Option<u64>,
    relay_timeout: Option<u64>,
) -> Result<RelayBuilder> {
    let mut builder = RelayBuilder::with_config(file);

    if let Some(addr) = public_addr {
        builder = builder
            .public_addr(&addr)
            .context("Invalid public address")?;
    }
    if let Some(addr) = relay_addr {
        builder = builder.relay_addr(&addr).context("Invalid relay address")?;
    }
    if let Some(secs) = idle_timeout {
        builder = builder.idle_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = sweep_interval {
        builder = builder.sweep_interval(Duration::from_secs(secs));
    }
    if let Some(secs) = relay_timeout {
        builder = builder.relay_timeout(Duration::from_secs(secs));
    }

    Ok(builder)
}

/// Merge CLI args with the config file's agent section, giving precedence to CLI args
fn build_agent_config(
    file: AgentConfigFile,
    tunnel_id: Option<String>,
    relay: Option<String>,
    local: Option<String>,
    reconnect_delay: Option<u64>,
) -> Result<AgentConfig> {
    let tunnel_id = tunnel_id
        .or(file.tunnel_id)
        .ok_or_else(|| anyhow::anyhow!("Tunnel ID is required (use --tunnel-id or config file)"))?;
    let relay = relay
        .or(file.relay)
        .ok_or_else(|| anyhow::anyhow!("Relay address is required (use --relay or config file)"))?;
    let local = local
        .or(file.local)
        .ok_or_else(|| anyhow::anyhow!("Local address is required (use --local or config file)"))?;

    let tunnel_id = TunnelId::parse(&tunnel_id)
        .with_context(|| format!("Invalid tunnel ID: '{}'", tunnel_id))?;
    validate_address(&relay, "relay")?;
    validate_address(&local, "local")?;

    let mut config = AgentConfig::new(tunnel_id, relay, local);
    if let Some(secs) = reconnect_delay.or(file.reconnect_delay) {
        config = config.with_reconnect_delay(Duration::from_secs(secs));
    }
    if let Some(secs) = file.heartbeat_interval {
        config = config.with_heartbeat_interval(Duration::from_secs(secs));
    }
    if let Some(secs) = file.connect_timeout {
        config = config.with_connect_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = file.local_timeout {
        config = config.with_local_timeout(Duration::from_secs(secs));
    }

    Ok(config)
}

/// Flip the shutdown channel on Ctrl+C
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });
    shutdown_rx
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    let file = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    match cli.command {
        Commands::Relay {
            public_addr,
            relay_addr,
            idle_timeout,
            sweep_interval,
            relay_timeout,
        } => {
            info!("Tunnelgate relay {} starting...", LONG_VERSION);

            let relay = build_relay_builder(
                file.relay,
                public_addr,
                relay_addr,
                idle_timeout,
                sweep_interval,
                relay_timeout,
            )?
            .bind()
            .await
            .context("Failed to start relay")?;

            info!("Public gateway: http://{}/<tunnel-id>/", relay.public_addr());
            info!("Relay port: {}", relay.relay_addr());

            relay
                .run(shutdown_on_ctrl_c())
                .await
                .context("Relay stopped with an error")?;
        }
        Commands::Agent {
            tunnel_id,
            relay,
            local,
            reconnect_delay,
        } => {
            let config = build_agent_config(file.agent, tunnel_id, relay, local, reconnect_delay)
                .context("Failed to build agent configuration")?;

            info!("Tunnel ID: {}", config.tunnel_id);
            info!("Relay: {}", config.relay_addr);
            info!("Local service: {}", config.local_addr);
            info!("Public URL: {}", config.public_url());

            TunnelAgent::new(config).run(shutdown_on_ctrl_c()).await;
        }
    }

    info!("Tunnelgate stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_address() {
        assert!(validate_address("relay.example.com:9000", "relay").is_ok());
        assert!(validate_address("localhost:8080", "local").is_ok());
        assert!(validate_address("192.168.1.100:3000", "local").is_ok());

        assert!(validate_address("relay.example.com", "relay").is_err());
        assert!(validate_address("relay.example.com:", "relay").is_err());
        assert!(validate_address("relay.example.com:abc", "relay").is_err());
        assert!(validate_address(":9000", "relay").is_err());
        assert!(validate_address("", "local").is_err());
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let file = AgentConfigFile {
            tunnel_id: Some("from-file".to_string()),
            relay: Some("file.example.com:9000".to_string()),
            local: Some("127.0.0.1:3000".to_string()),
            reconnect_delay: Some(10),
            heartbeat_interval: Some(15),
            ..Default::default()
        };

        let config = build_agent_config(
            file,
            Some("from-cli".to_string()),
            None,
            None,
            Some(1),
        )
        .unwrap();

        assert_eq!(config.tunnel_id.as_str(), "from-cli");
        assert_eq!(config.relay_addr, "file.example.com:9000");
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_agent_config_requires_fields() {
        let result = build_agent_config(AgentConfigFile::default(), None, None, None, None);
        assert!(result.is_err());

        let result = build_agent_config(
            AgentConfigFile::default(),
            Some("bad id".to_string()),
            Some("relay:9000".to_string()),
            Some("127.0.0.1:3000".to_string()),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_config_file_sections() {
        let file: ConfigFile = serde_yaml::from_str(
            r#"
relay:
  public_addr: 0.0.0.0:8080
  idle_timeout: 120
agent:
  tunnel_id: myapp
  relay: relay.example.com:9000
  local: 127.0.0.1:3000
"#,
        )
        .unwrap();

        assert_eq!(file.relay.public_addr.port(), 8080);
        assert_eq!(file.relay.idle_timeout, Duration::from_secs(120));
        assert_eq!(file.relay.relay_addr.port(), 9000);
        assert_eq!(file.agent.tunnel_id.as_deref(), Some("myapp"));
    }

    #[test]
    fn test_relay_builder_merges_cli() {
        let builder = build_relay_builder(
            GatewayConfig::default(),
            Some("127.0.0.1:8080".to_string()),
            None,
            Some(60),
            None,
            None,
        )
        .unwrap();

        assert_eq!(builder.config().public_addr.port(), 8080);
        assert_eq!(builder.config().relay_addr.port(), 9000);
        assert_eq!(builder.config().idle_timeout, Duration::from_secs(60));
    }
}
