use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kernelfleet::bootstrap::SshLauncher;
use kernelfleet::config::{BootstrapConfig, FleetConfig, NodeConfig};
use kernelfleet::fleet::FleetManager;
use kernelfleet::shutdown::run_until_signalled;

#[derive(Parser, Debug)]
#[command(name = "kernelfleet")]
#[command(version)]
#[command(about = "Orchestrator for sandboxed execution kernels on remote compute nodes")]
struct Args {
    /// Compute node to register, format: "account@host" or
    /// "account@host:capacity". Repeatable.
    #[arg(long = "node", required = true)]
    nodes: Vec<String>,

    /// Default unit capacity for nodes that do not specify one
    #[arg(long, default_value = "10")]
    capacity: usize,

    /// Command run remotely to start each node's resident broker
    #[arg(long, default_value = "kernelfleet-broker")]
    broker_command: String,

    /// Expected spacing between node liveness pulses
    #[arg(long, default_value = "3000")]
    beat_interval_ms: u64,

    /// Grace period before a new node's first pulse is expected
    #[arg(long, default_value = "5000")]
    first_beat_ms: u64,

    /// Polls of a starting broker's output before bootstrap gives up
    #[arg(long, default_value = "10")]
    bootstrap_attempts: u32,

    /// Spacing between bootstrap polls
    #[arg(long, default_value = "2000")]
    bootstrap_delay_ms: u64,

    /// Bound on every control-channel request
    #[arg(long, default_value = "10000")]
    command_timeout_ms: u64,
}

/// Parse "account@host" or "account@host:capacity".
fn parse_node(spec: &str, default_capacity: usize) -> Option<(String, String, usize)> {
    let (account, rest) = spec.split_once('@')?;
    if account.is_empty() || rest.is_empty() {
        return None;
    }
    match rest.rsplit_once(':') {
        Some((host, capacity)) if !host.is_empty() => {
            let capacity: usize = capacity.parse().ok()?;
            Some((account.to_string(), host.to_string(), capacity))
        }
        _ => Some((account.to_string(), rest.to_string(), default_capacity)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = FleetConfig {
        bootstrap: BootstrapConfig {
            attempts: args.bootstrap_attempts,
            poll_delay: Duration::from_millis(args.bootstrap_delay_ms),
        },
        command_timeout: Duration::from_millis(args.command_timeout_ms),
        ..FleetConfig::default()
    };

    let fleet = FleetManager::new(config, Arc::new(SshLauncher));

    for spec in &args.nodes {
        let Some((account, host, capacity)) = parse_node(spec, args.capacity) else {
            tracing::warn!(spec, "Invalid node spec, expected account@host[:capacity]");
            continue;
        };
        let mut node_config = NodeConfig::new(host, account).with_capacity(capacity);
        node_config.broker_command = args.broker_command.clone();
        node_config.beat_interval = Duration::from_millis(args.beat_interval_ms);
        node_config.first_beat = Duration::from_millis(args.first_beat_ms);

        match fleet.add_node(node_config).await {
            Ok(node_id) => tracing::info!(node_id = %node_id, spec, "Node added"),
            Err(e) => tracing::error!(spec, error = %e, "Node registration failed"),
        }
    }

    if fleet.node_ids().await.is_empty() {
        return Err("no compute node could be registered".into());
    }

    run_until_signalled(&fleet).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_node_without_capacity() {
        let (account, host, capacity) = parse_node("sandbox@worker1.example.com", 10).unwrap();
        assert_eq!(account, "sandbox");
        assert_eq!(host, "worker1.example.com");
        assert_eq!(capacity, 10);
    }

    #[test]
    fn parses_node_with_capacity() {
        let (account, host, capacity) = parse_node("sandbox@10.0.0.5:4", 10).unwrap();
        assert_eq!(account, "sandbox");
        assert_eq!(host, "10.0.0.5");
        assert_eq!(capacity, 4);
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!(parse_node("no-account-host", 10).is_none());
        assert!(parse_node("@host", 10).is_none());
        assert!(parse_node("account@", 10).is_none());
        assert!(parse_node("account@host:notanumber", 10).is_none());
    }
}
