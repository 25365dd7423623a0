//! Participant registry: who is registered, who is currently connected,
//! and the outbound `Messenger` (a [`Client`]) used to push multicasts to
//! each connected participant's listening port.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;
use tracing::warn;

use crate::communication::client::Client;
use crate::coordinator::log::MessageLog;
use crate::coordinator::ForwardMulticast;
use crate::error::{Error, ErrorKind, Result};

/// A registered pub/sub participant. Identity is `id`; equality/hashing in
/// the manager's bookkeeping is by `id` only.
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: u32,
    pub hostname: String,
    pub port: u16,
    pub connected: bool,
    pub disconnect_time: Option<SystemTime>,
}

struct Entry {
    participant: Participant,
    messenger: Option<Arc<Client>>,
}

/// Registered participants indexed by id, with helpers to resolve a
/// participant by the hostname its control connection originated from.
pub struct ParticipantManager {
    entries: Mutex<LinkedHashMap<u32, Entry>>,
    next_id: AtomicU32,
}

impl Default for ParticipantManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ParticipantManager {
    pub fn new() -> Self {
        ParticipantManager {
            entries: Mutex::new(LinkedHashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Registers a new participant listening at `(hostname, port)`,
    /// wrapping `messenger` (an outbound [`Client`] already pointed at that
    /// endpoint) for later multicast delivery.
    pub fn register(&self, hostname: &str, port: u16, messenger: Arc<Client>) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let participant = Participant {
            id,
            hostname: hostname.to_owned(),
            port,
            connected: true,
            disconnect_time: None,
        };
        self.entries.lock().insert(
            id,
            Entry {
                participant,
                messenger: Some(messenger),
            },
        );
        id
    }

    /// Removes the participant whose control connection originated from
    /// `hostname`, closing its messenger.
    pub fn deregister(&self, hostname: &str) -> Result<u32> {
        let mut entries = self.entries.lock();
        let id = find_id_by_hostname(&entries, hostname)?;
        entries.remove(&id);
        Ok(id)
    }

    /// Marks the participant from `hostname` disconnected, recording the
    /// moment for later replay windowing. The messenger is kept so it can
    /// be resurrected on reconnect.
    pub fn disconnect(&self, hostname: &str) -> Result<u32> {
        let mut entries = self.entries.lock();
        let id = find_id_by_hostname(&entries, hostname)?;
        let entry = entries.get_mut(&id).expect("id just resolved above");
        entry.participant.connected = false;
        entry.participant.disconnect_time = Some(SystemTime::now());
        Ok(id)
    }

    /// Marks the participant from `hostname` connected again, updating its
    /// listening port. Returns the id, the disconnect time that should seed
    /// the replay window (falling back to `now` if the participant was never
    /// recorded as disconnected), and whether the caller must rebuild the
    /// outbound messenger (the port changed, or none was ever set) via
    /// [`set_messenger`](Self::set_messenger).
    pub fn reconnect(&self, hostname: &str, port: u16) -> Result<(u32, SystemTime, bool)> {
        let mut entries = self.entries.lock();
        let id = find_id_by_hostname(&entries, hostname)?;
        let entry = entries.get_mut(&id).expect("id just resolved above");

        let disconnect_time = entry.participant.disconnect_time.unwrap_or_else(SystemTime::now);
        let needs_new_messenger = entry.participant.port != port || entry.messenger.is_none();

        entry.participant.port = port;
        entry.participant.connected = true;
        entry.participant.disconnect_time = None;

        Ok((id, disconnect_time, needs_new_messenger))
    }

    /// Returns the currently-connected messenger for `id`, if any.
    pub fn messenger(&self, id: u32) -> Option<Arc<Client>> {
        self.entries.lock().get(&id).and_then(|e| e.messenger.clone())
    }

    /// Replaces the outbound messenger for `id`, e.g. after `reconnect`
    /// reports the participant came back on a different port and the caller
    /// has constructed and connected a fresh `Client` for it.
    pub fn set_messenger(&self, id: u32, messenger: Arc<Client>) {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.messenger = Some(messenger);
        }
    }

    /// Resolves a connected participant's id from its control connection's
    /// hostname.
    pub fn id_of(&self, hostname: &str) -> Option<u32> {
        self.entries
            .lock()
            .values()
            .find(|e| e.participant.hostname == hostname && e.participant.connected)
            .map(|e| e.participant.id)
    }

    /// Sends `{origin_id, text}` to every currently-connected messenger and
    /// appends one copy to `log` timestamped at the moment of the first
    /// successful send. The whole operation runs under the manager's single
    /// lock, which is what gives every connected peer an identical relative
    /// delivery order across multicasts.
    pub fn broadcast(&self, origin_id: u32, text: &str, log: &MessageLog) {
        let mut entries = self.entries.lock();
        let mut logged_at: Option<SystemTime> = None;

        for entry in entries.values_mut() {
            if !entry.participant.connected {
                continue;
            }
            let Some(client) = entry.messenger.as_ref() else {
                continue;
            };
            let now = SystemTime::now();
            let forward = ForwardMulticast {
                origin_id,
                text: text.to_owned(),
                timestamp: now
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0),
            };
            match client.send_async(&forward) {
                Ok(()) => {
                    logged_at.get_or_insert_with(SystemTime::now);
                }
                Err(e) => {
                    warn!(
                        id = entry.participant.id,
                        error = %e,
                        "multicast delivery failed, dropping participant"
                    );
                    entry.participant.connected = false;
                }
            }
        }

        if let Some(timestamp) = logged_at {
            log.append(origin_id, text.to_owned(), timestamp);
        }
    }

    /// Snapshot of every currently registered participant (connected or
    /// not), in registration order.
    pub fn snapshot(&self) -> Vec<Participant> {
        self.entries
            .lock()
            .values()
            .map(|e| e.participant.clone())
            .collect()
    }
}

fn find_id_by_hostname(entries: &LinkedHashMap<u32, Entry>, hostname: &str) -> Result<u32> {
    entries
        .values()
        .find(|e| e.participant.hostname == hostname)
        .map(|e| e.participant.id)
        .ok_or_else(|| Error::simple(ErrorKind::Policy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pool() -> Arc<crate::pool::Pool> {
        Arc::new(crate::pool::Pool::new(0))
    }

    fn dummy_client(pool: &Arc<crate::pool::Pool>) -> Arc<Client> {
        Arc::new(Client::new(
            Arc::clone(pool),
            crate::communication::Endpoint::new("127.0.0.1", 1),
        ))
    }

    #[test]
    fn deregister_after_register_leaves_manager_unchanged() {
        let pool = pool();
        let manager = ParticipantManager::new();
        let before = manager.snapshot().len();

        let id = manager.register("10.0.0.1", 9000, dummy_client(&pool));
        manager.deregister("10.0.0.1").unwrap();

        assert_eq!(manager.snapshot().len(), before);
        assert!(manager.id_of("10.0.0.1").is_none());
        let _ = id;
    }

    #[test]
    fn disconnect_then_reconnect_preserves_identity() {
        let pool = pool();
        let manager = ParticipantManager::new();
        let id = manager.register("10.0.0.2", 9001, dummy_client(&pool));

        manager.disconnect("10.0.0.2").unwrap();
        assert!(manager.id_of("10.0.0.2").is_none());

        let (reconnected_id, _, needs_new_messenger) = manager.reconnect("10.0.0.2", 9001).unwrap();
        assert_eq!(reconnected_id, id);
        assert!(!needs_new_messenger, "same port, existing messenger should be kept");
        assert_eq!(manager.id_of("10.0.0.2"), Some(id));
    }

    #[test]
    fn reconnect_from_a_new_port_requests_a_fresh_messenger() {
        let pool = pool();
        let manager = ParticipantManager::new();
        manager.register("10.0.0.3", 9002, dummy_client(&pool));

        manager.disconnect("10.0.0.3").unwrap();
        let (id, _, needs_new_messenger) = manager.reconnect("10.0.0.3", 9003).unwrap();
        assert!(needs_new_messenger, "reconnecting from a new port must rebuild the messenger");

        manager.set_messenger(id, dummy_client(&pool));
        let snapshot = manager.snapshot();
        let participant = snapshot.iter().find(|p| p.id == id).unwrap();
        assert_eq!(participant.port, 9003);
    }

    #[test]
    fn unknown_hostname_operations_fail_with_policy_error() {
        let manager = ParticipantManager::new();
        let err = manager.deregister("nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Policy);
    }
}
