//! Request/reply transport between the orchestrator and a node's
//! resident broker.
//!
//! Wire format: one JSON object per line. Requests are
//! `{"command": <name>, "content": <params>}`, replies are
//! `{"type": "success"|"error", "content": <payload>}`. The command
//! vocabulary is a closed enum; a broker never sees a command name that
//! did not deserialize from this allow-list, and the orchestrator never
//! dispatches on a name taken raw from the network.
//!
//! An `error` reply is an application-level failure and is surfaced to
//! the caller as [`FleetError::CommandFailed`]. Transport-level failure
//! (refused connection, timeout, EOF, malformed frame) is fatal for the
//! channel and reported as [`FleetError::NodeUnreachable`]: the stream
//! can no longer be trusted to sit on a frame boundary (a late reply to
//! a timed-out request would be attributed to the next command), so the
//! channel poisons itself and every later call fails fast.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::{FleetError, Result};
use crate::unit::{UnitConnection, UnitId};

/// Literal payload exchanged by the post-bootstrap identity check.
pub const HANDSHAKE: &str = "handshake";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", content = "content", rename_all = "snake_case")]
pub enum Command {
    StartUnit {
        resource_limits: HashMap<String, u64>,
    },
    KillUnit {
        unit_id: UnitId,
    },
    InterruptUnit {
        unit_id: UnitId,
    },
    RestartUnit {
        unit_id: UnitId,
    },
    PurgeAll,
    Handshake(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum Reply {
    Success(Value),
    Error(Value),
}

/// Successful `start_unit` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedUnit {
    pub unit_id: UnitId,
    pub connection: UnitConnection,
}

/// Successful `restart_unit` payload. The unit id is unchanged; only the
/// connection record (same ports, fresh key) is reissued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartedUnit {
    pub connection: UnitConnection,
}

struct ChannelIo {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Set on the first transport failure; the stream is desynchronized
    /// from then on and must not be read again
    poisoned: bool,
}

/// One authenticated request/reply session with a resident broker.
///
/// Synchronous RPC semantics: the io mutex admits a single outstanding
/// request per channel, so commands to the same node are serialized and
/// the remote broker never sees interleaved requests. Every call is
/// bounded by `command_timeout`; a node that stops responding yields
/// `NodeUnreachable` instead of a hang.
pub struct ControlChannel {
    peer: String,
    command_timeout: Duration,
    io: Mutex<ChannelIo>,
}

impl ControlChannel {
    pub async fn connect(peer: &str, command_timeout: Duration) -> Result<Self> {
        let stream = timeout(command_timeout, TcpStream::connect(peer))
            .await
            .map_err(|_| unreachable(peer, "connect timed out"))?
            .map_err(|e| unreachable(peer, &e.to_string()))?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            peer: peer.to_string(),
            command_timeout,
            io: Mutex::new(ChannelIo {
                reader: BufReader::new(read),
                writer,
                poisoned: false,
            }),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send one command and wait for its reply. Returns the success
    /// content; an `error` reply becomes `CommandFailed`.
    pub async fn send(&self, command: Command) -> Result<Value> {
        let mut frame = serde_json::to_string(&command)
            .map_err(|e| FleetError::CommandFailed(format!("failed to encode command: {e}")))?;
        frame.push('\n');

        let mut io = self.io.lock().await;
        if io.poisoned {
            return Err(unreachable(
                &self.peer,
                "channel poisoned by an earlier transport failure",
            ));
        }
        let outcome = timeout(self.command_timeout, async {
            io.writer
                .write_all(frame.as_bytes())
                .await
                .map_err(|e| unreachable(&self.peer, &e.to_string()))?;
            io.writer
                .flush()
                .await
                .map_err(|e| unreachable(&self.peer, &e.to_string()))?;

            let mut line = String::new();
            let n = io
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| unreachable(&self.peer, &e.to_string()))?;
            if n == 0 {
                return Err(unreachable(&self.peer, "connection closed by broker"));
            }
            serde_json::from_str::<Reply>(&line)
                .map_err(|e| unreachable(&self.peer, &format!("malformed frame: {e}")))
        })
        .await;
        let reply = match outcome {
            Err(_) => {
                io.poisoned = true;
                return Err(unreachable(&self.peer, "command timed out"));
            }
            Ok(Err(e)) => {
                io.poisoned = true;
                return Err(e);
            }
            Ok(Ok(reply)) => reply,
        };

        match reply {
            Reply::Success(content) => Ok(content),
            Reply::Error(content) => Err(FleetError::CommandFailed(error_message(content))),
        }
    }

    /// Identity/liveness check performed immediately after bootstrap.
    pub async fn handshake(&self) -> Result<()> {
        let content = self.send(Command::Handshake(HANDSHAKE.to_string())).await?;
        match content {
            Value::String(s) if s == HANDSHAKE => Ok(()),
            other => Err(unreachable(
                &self.peer,
                &format!("unexpected handshake reply: {other}"),
            )),
        }
    }

    pub async fn start_unit(
        &self,
        resource_limits: HashMap<String, u64>,
    ) -> Result<StartedUnit> {
        let content = self.send(Command::StartUnit { resource_limits }).await?;
        serde_json::from_value(content)
            .map_err(|e| unreachable(&self.peer, &format!("malformed start_unit reply: {e}")))
    }

    pub async fn kill_unit(&self, unit_id: UnitId) -> Result<()> {
        self.send(Command::KillUnit { unit_id }).await.map(|_| ())
    }

    pub async fn interrupt_unit(&self, unit_id: UnitId) -> Result<()> {
        self.send(Command::InterruptUnit { unit_id })
            .await
            .map(|_| ())
    }

    pub async fn restart_unit(&self, unit_id: UnitId) -> Result<UnitConnection> {
        let content = self.send(Command::RestartUnit { unit_id }).await?;
        let restarted: RestartedUnit = serde_json::from_value(content)
            .map_err(|e| unreachable(&self.peer, &format!("malformed restart_unit reply: {e}")))?;
        Ok(restarted.connection)
    }

    pub async fn purge_all(&self) -> Result<()> {
        self.send(Command::PurgeAll).await.map(|_| ())
    }
}

fn unreachable(peer: &str, reason: &str) -> FleetError {
    FleetError::NodeUnreachable(format!("{peer}: {reason}"))
}

fn error_message(content: Value) -> String {
    match content {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn transport_timeout_poisons_the_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            // Answer the first request far too late, then keep the
            // connection open.
            let _ = lines.next_line().await;
            tokio::time::sleep(Duration::from_millis(150)).await;
            let _ = write
                .write_all(b"{\"type\":\"error\",\"content\":\"stale\"}\n")
                .await;
            let _ = lines.next_line().await;
        });

        let channel = ControlChannel::connect(&addr, Duration::from_millis(50))
            .await
            .unwrap();
        let err = channel.purge_all().await.unwrap_err();
        assert!(matches!(err, FleetError::NodeUnreachable(_)));

        // The late reply is now sitting in the socket. A fresh command
        // must not read it as its own reply.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let err = channel.purge_all().await.unwrap_err();
        assert!(
            matches!(err, FleetError::NodeUnreachable(_)),
            "stale reply leaked through: {err:?}"
        );
    }

    #[test]
    fn command_wire_format() {
        let cmd = Command::KillUnit {
            unit_id: UnitId::new(),
        };
        let v: Value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["command"], "kill_unit");
        assert!(v["content"]["unit_id"].is_string());

        let v: Value = serde_json::to_value(Command::PurgeAll).unwrap();
        assert_eq!(v["command"], "purge_all");
        assert!(v.get("content").is_none());

        let v: Value =
            serde_json::to_value(Command::Handshake(HANDSHAKE.to_string())).unwrap();
        assert_eq!(v["command"], "handshake");
        assert_eq!(v["content"], "handshake");
    }

    #[test]
    fn reply_wire_format() {
        let reply: Reply =
            serde_json::from_str(r#"{"type":"success","content":{"unit_id":null}}"#).unwrap();
        assert!(matches!(reply, Reply::Success(_)));

        let reply: Reply =
            serde_json::from_str(r#"{"type":"error","content":"no such unit"}"#).unwrap();
        match reply {
            Reply::Error(content) => assert_eq!(error_message(content), "no such unit"),
            other => panic!("expected error reply, got {other:?}"),
        }
    }

    #[test]
    fn unknown_command_is_rejected_by_the_allow_list() {
        let err = serde_json::from_str::<Command>(
            r#"{"command":"__getattribute__","content":{}}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn started_unit_round_trip() {
        let started = StartedUnit {
            unit_id: UnitId::new(),
            connection: UnitConnection {
                ip: "10.0.0.7".to_string(),
                key: "secret".to_string(),
                shell_port: 5001,
                stdin_port: 5002,
                iopub_port: 5003,
                hb_port: 5004,
            },
        };
        let v = serde_json::to_value(&started).unwrap();
        let back: StartedUnit = serde_json::from_value(v).unwrap();
        assert_eq!(back.unit_id, started.unit_id);
        assert_eq!(back.connection, started.connection);
    }
}
