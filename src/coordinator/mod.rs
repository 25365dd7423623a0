//! Publish/subscribe multicast coordinator with a time-windowed replay log
//! for temporarily disconnected subscribers.
//!
//! A participant talks to the coordinator over short-lived, one-message
//! control connections (`Register`, `Deregister`, `Disconnect`,
//! `Reconnect`, `SendMulticast`); the coordinator in turn holds one
//! persistent outbound connection per connected participant, over which
//! `ForwardMulticast` frames are pushed. Participants are identified by the
//! hostname their control connection originates from, since the wire
//! schema's control messages carry no explicit participant id (see
//! `DESIGN.md`).

pub mod log;
pub mod manager;

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::communication::client::Client;
use crate::communication::Endpoint;
use crate::error::{Error, ErrorKind, Result};
use crate::pool::Pool;
use crate::wire::MessageParser;

pub use log::{LoggedMessage, MessageLog};
pub use manager::ParticipantManager;

/// A control message sent by a participant to the coordinator over a
/// single-use TCP connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CoordinatorMessage {
    Register { port: u16 },
    Deregister,
    Disconnect,
    Reconnect { port: u16 },
    SendMulticast { text: String },
}

/// A multicast forwarded by the coordinator to a connected participant over
/// its persistent outbound connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardMulticast {
    pub origin_id: u32,
    pub text: String,
    /// Milliseconds since the Unix epoch, carried for display purposes;
    /// replay windowing itself is computed against the coordinator's own
    /// monotonic clock (see [`log::MessageLog`]).
    pub timestamp: u64,
}

/// Ties a [`ParticipantManager`] and [`MessageLog`] together and drives the
/// per-connection control-message dispatch.
pub struct Coordinator {
    pool: Arc<Pool>,
    participants: ParticipantManager,
    log: MessageLog,
}

impl Coordinator {
    pub fn new(pool: Arc<Pool>, replay_threshold: Duration) -> Self {
        Coordinator {
            pool,
            participants: ParticipantManager::new(),
            log: MessageLog::new(replay_threshold),
        }
    }

    /// Handles one control message from `peer_hostname`.
    pub fn handle(&self, message: CoordinatorMessage, peer_hostname: &str) -> Result<()> {
        match message {
            CoordinatorMessage::Register { port } => self.handle_register(peer_hostname, port),
            CoordinatorMessage::Deregister => self.handle_deregister(peer_hostname),
            CoordinatorMessage::Disconnect => self.handle_disconnect(peer_hostname),
            CoordinatorMessage::Reconnect { port } => self.handle_reconnect(peer_hostname, port),
            CoordinatorMessage::SendMulticast { text } => {
                self.handle_send_multicast(peer_hostname, text)
            }
        }
    }

    fn handle_register(&self, hostname: &str, port: u16) -> Result<()> {
        let client = Arc::new(Client::new(
            Arc::clone(&self.pool),
            Endpoint::new(hostname.to_owned(), port),
        ));
        client.connect()?;
        let id = self.participants.register(hostname, port, client);
        info!(id, hostname, port, "participant registered");
        Ok(())
    }

    fn handle_deregister(&self, hostname: &str) -> Result<()> {
        let id = self.participants.deregister(hostname)?;
        info!(id, hostname, "participant deregistered");
        Ok(())
    }

    fn handle_disconnect(&self, hostname: &str) -> Result<()> {
        let id = self.participants.disconnect(hostname)?;
        info!(id, hostname, "participant disconnected");
        Ok(())
    }

    fn handle_reconnect(&self, hostname: &str, port: u16) -> Result<()> {
        let (id, disconnect_time, needs_new_messenger) = self.participants.reconnect(hostname, port)?;

        if needs_new_messenger {
            // The participant came back on a different port (or never had a
            // messenger to begin with): a `Client`'s destination is fixed at
            // construction, so the stale one can't just be repointed — build
            // and connect a fresh one targeting the new endpoint.
            let client = Arc::new(Client::new(
                Arc::clone(&self.pool),
                Endpoint::new(hostname.to_owned(), port),
            ));
            client.connect()?;
            self.participants.set_messenger(id, client);
        }

        let replay = self.log.replay_since(disconnect_time);
        info!(id, hostname, replayed = replay.len(), "participant reconnected");

        if let Some(client) = self.participants.messenger(id) {
            for entry in replay {
                let forward = ForwardMulticast {
                    origin_id: entry.origin_id,
                    text: entry.text,
                    timestamp: system_millis(entry.timestamp),
                };
                if client.send_async(&forward).is_err() {
                    warn!(id, "replay delivery failed, dropping participant");
                    let _ = self.participants.disconnect(hostname);
                    break;
                }
            }
        }

        Ok(())
    }

    fn handle_send_multicast(&self, hostname: &str, text: String) -> Result<()> {
        let origin_id = self
            .participants
            .id_of(hostname)
            .ok_or_else(|| Error::simple(ErrorKind::Policy))?;

        // Broadcasting and logging both happen under the manager's single
        // lock (see `ParticipantManager::broadcast`), which is what gives
        // every connected peer an identical relative delivery order.
        self.participants.broadcast(origin_id, &text, &self.log);
        Ok(())
    }
}

fn system_millis(time: std::time::SystemTime) -> u64 {
    time.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Blocks accepting connections on `listener`, reading one
/// [`CoordinatorMessage`] per connection and dispatching it to
/// `coordinator`. Intended to run on a dedicated thread.
pub fn run_control_listener(listener: TcpListener, coordinator: Arc<Coordinator>) {
    loop {
        let (stream, addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "control listener accept failed, exiting");
                return;
            }
        };
        let coordinator = Arc::clone(&coordinator);
        std::thread::spawn(move || {
            let hostname = addr.ip().to_string();
            if let Err(e) = handle_control_connection(stream, &coordinator, &hostname) {
                warn!(error = %e, %hostname, "control connection failed");
            }
        });
    }
}

fn handle_control_connection(
    mut stream: TcpStream,
    coordinator: &Coordinator,
    hostname: &str,
) -> Result<()> {
    use std::io::Read;

    let mut parser = MessageParser::<CoordinatorMessage>::new();
    let mut buf = [0u8; 4096];
    while !parser.has_complete_message() {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => parser.feed(&buf[..n]),
            Err(e) => return Err(Error::wrapped(ErrorKind::Transport, e)),
        }
    }

    if let Some(message) = parser.take_message() {
        coordinator.handle(message, hostname)?;
    }
    Ok(())
}
