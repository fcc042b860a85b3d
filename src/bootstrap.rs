//! Remote broker launch and port discovery.
//!
//! Each compute node runs one resident broker, started over ssh under a
//! restricted account. The broker prints the TCP port of its control
//! listener on the first line of stdout; bootstrap polls for that line a
//! bounded number of times and gives up if it never arrives. Anything
//! other than a parseable port is a failed bootstrap, never a hang.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;

use crate::config::{BootstrapConfig, NodeConfig};

/// Handle to a launched broker process. `terminate` must be idempotent;
/// controllers call it from both the failure path and teardown.
#[async_trait]
pub trait BrokerProcess: Send + Sync {
    /// Next line of the broker's stdout, `None` at EOF.
    async fn next_line(&mut self) -> io::Result<Option<String>>;

    /// Stop the broker and reap everything it spawned.
    async fn terminate(&mut self) -> io::Result<()>;
}

/// Seam between the fleet and the mechanism that starts brokers. Tests
/// substitute an in-process launcher; production uses [`SshLauncher`].
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, config: &NodeConfig) -> io::Result<Box<dyn BrokerProcess>>;
}

/// Launches brokers with `ssh account@host <broker_command>`.
pub struct SshLauncher;

#[async_trait]
impl Launcher for SshLauncher {
    async fn launch(&self, config: &NodeConfig) -> io::Result<Box<dyn BrokerProcess>> {
        let target = format!("{}@{}", config.account, config.host);
        tracing::info!(target = %target, command = %config.broker_command, "Launching resident broker");
        let mut child = Command::new("ssh")
            .arg(&target)
            .arg(&config.broker_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "broker stdout not captured")
        })?;
        Ok(Box::new(SshBroker {
            child,
            lines: BufReader::new(stdout).lines(),
            target,
            account: config.account.clone(),
            terminated: false,
        }))
    }
}

pub struct SshBroker {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    target: String,
    account: String,
    terminated: bool,
}

#[async_trait]
impl BrokerProcess for SshBroker {
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.lines.next_line().await
    }

    async fn terminate(&mut self) -> io::Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        self.child.start_kill()?;
        let _ = self.child.wait().await;
        // The restricted account runs nothing but this broker and its
        // units, so a remote sweep of the account catches any process
        // that detached from the ssh session.
        let sweep = Command::new("ssh")
            .arg(&self.target)
            .arg(format!("pkill -9 -u {}", self.account))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = sweep {
            tracing::warn!(target = %self.target, error = %e, "Remote process sweep failed");
        }
        Ok(())
    }
}

/// Poll the broker's stdout for its control port. Up to
/// `config.attempts` polls, each bounded by `config.poll_delay`.
pub async fn discover_port(
    process: &mut dyn BrokerProcess,
    config: &BootstrapConfig,
) -> io::Result<u16> {
    for _ in 0..config.attempts {
        match timeout(config.poll_delay, process.next_line()).await {
            Err(_) => continue,
            Ok(Ok(Some(line))) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                return line.parse::<u16>().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("broker announced malformed port: {line:?}"),
                    )
                });
            }
            Ok(Ok(None)) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "broker exited before announcing its port",
                ));
            }
            Ok(Err(e)) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::TimedOut,
        "broker never announced its port",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct ScriptedBroker {
        lines: VecDeque<Option<String>>,
    }

    impl ScriptedBroker {
        fn new(lines: Vec<Option<&str>>) -> Self {
            Self {
                lines: lines
                    .into_iter()
                    .map(|l| l.map(str::to_string))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl BrokerProcess for ScriptedBroker {
        async fn next_line(&mut self) -> io::Result<Option<String>> {
            match self.lines.pop_front() {
                Some(line) => Ok(line),
                None => std::future::pending().await,
            }
        }

        async fn terminate(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn fast_config() -> BootstrapConfig {
        BootstrapConfig {
            attempts: 3,
            poll_delay: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn discovers_port_from_first_line() {
        let mut broker = ScriptedBroker::new(vec![Some("45731")]);
        let port = discover_port(&mut broker, &fast_config()).await.unwrap();
        assert_eq!(port, 45731);
    }

    #[tokio::test]
    async fn skips_blank_lines() {
        let mut broker = ScriptedBroker::new(vec![Some(""), Some("  45731  ")]);
        let port = discover_port(&mut broker, &fast_config()).await.unwrap();
        assert_eq!(port, 45731);
    }

    #[tokio::test]
    async fn malformed_port_is_an_error() {
        let mut broker = ScriptedBroker::new(vec![Some("not-a-port")]);
        let err = discover_port(&mut broker, &fast_config()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn eof_before_port_is_an_error() {
        let mut broker = ScriptedBroker::new(vec![None]);
        let err = discover_port(&mut broker, &fast_config()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn silent_broker_exhausts_attempts() {
        let mut broker = ScriptedBroker::new(vec![]);
        let err = discover_port(&mut broker, &fast_config()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
