use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::communication::tasks::ServerTask;
use crate::communication::{Endpoint, MessageId, Node, SendQueueMessage};
use crate::error::{Error, ErrorKind, Result};
use crate::pool::{Handle, Pool, Task};
use crate::queue::Queue;

/// Per-`MessageId` outcome slots, mirroring [`crate::communication::client::Client`]'s
/// pending-send bookkeeping: one one-shot channel per in-flight synchronous
/// send, removed the moment its outcome is read.
type PendingSends = Mutex<HashMap<MessageId, oneshot::Sender<i32>>>;

/// Listens on `listen_port` and fans incoming connections out across a
/// `send_queues` map keyed by peer `Endpoint`, so a caller can `send` to any
/// peer that has ever connected without tracking the connection itself.
pub struct Server {
    node: Node,
    pool: Arc<Pool>,
    server_handle: Handle,
    send_queues: Arc<Mutex<HashMap<Endpoint, Arc<Queue<SendQueueMessage>>>>>,
    message_id: std::sync::atomic::AtomicU64,
    pending: Arc<PendingSends>,
}

impl Server {
    pub fn new(pool: Arc<Pool>, listen_port: u16) -> Self {
        let node = Node::new(Arc::clone(&pool));
        let send_queues: Arc<Mutex<HashMap<Endpoint, Arc<Queue<SendQueueMessage>>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let pending: Arc<PendingSends> = Arc::new(Mutex::new(HashMap::new()));

        let new_client_queues = Arc::clone(&send_queues);
        let new_client_callback = Box::new(move |endpoint: Endpoint, queue: Arc<Queue<SendQueueMessage>>| {
            info!(%endpoint, "new client connected");
            new_client_queues.lock().insert(endpoint, queue);
        });

        let pending_for_cb = Arc::clone(&pending);
        let send_callback: Arc<dyn Fn(MessageId, i32) + Send + Sync> =
            Arc::new(move |id, status| {
                if let Some(tx) = pending_for_cb.lock().remove(&id) {
                    let _ = tx.send(status);
                }
            });

        let server_task = ServerTask::new(
            listen_port,
            Arc::clone(&pool),
            Arc::clone(node.receive_queue()),
            new_client_callback,
            send_callback,
        );
        let server_handle = pool.add_task(Box::new(server_task) as Box<dyn Task>);

        Server {
            node,
            pool,
            server_handle,
            send_queues,
            message_id: std::sync::atomic::AtomicU64::new(0),
            pending,
        }
    }

    /// Serializes and sends `message` to `destination`, blocking until the
    /// write completes. Fails if `destination` has never connected.
    pub fn send<T: Serialize>(&self, message: &T, destination: &Endpoint) -> Result<i32> {
        let (id, rx) = self.dispatch_send(message, destination, false)?;
        let rx = rx.expect("synchronous dispatch always registers a result channel");
        rx.recv().map_err(|_| Error::simple(ErrorKind::Transport))
    }

    /// Serializes and enqueues `message` for `destination` without waiting
    /// for the write to complete.
    pub fn send_async<T: Serialize>(&self, message: &T, destination: &Endpoint) -> Result<()> {
        self.dispatch_send(message, destination, true).map(|_| ())
    }

    fn dispatch_send<T: Serialize>(
        &self,
        message: &T,
        destination: &Endpoint,
        is_async: bool,
    ) -> Result<(MessageId, Option<oneshot::Receiver<i32>>)> {
        let queue = {
            let guard = self.send_queues.lock();
            guard.get(destination).cloned()
        };

        let queue = match queue {
            Some(q) => q,
            None => {
                warn!(%destination, "send to unknown peer");
                return Err(Error::simple(ErrorKind::Policy));
            }
        };

        let id = self
            .message_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        let payload = crate::wire::serialize(message)?;

        let rx = if is_async {
            None
        } else {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(id, tx);
            Some(rx)
        };

        queue.push(SendQueueMessage {
            id,
            payload,
            is_async,
        });

        Ok((id, rx))
    }

    /// Blocks waiting for the next framed message from any connected peer.
    pub fn receive<T: DeserializeOwned>(&self, source: &mut Option<Endpoint>) -> Option<T> {
        self.node.receive(source)
    }

    /// As [`receive`](Server::receive), but gives up after `timeout`.
    pub fn receive_timed<T: DeserializeOwned>(
        &self,
        timeout: Duration,
        source: &mut Option<Endpoint>,
    ) -> Option<T> {
        self.node.receive_timed(timeout, source)
    }

    /// Snapshot of every peer endpoint this server currently has an open
    /// send queue for.
    pub fn get_connected(&self) -> HashSet<Endpoint> {
        self.send_queues.lock().keys().cloned().collect()
    }

}

impl Drop for Server {
    fn drop(&mut self) {
        self.pool.cancel_task(self.server_handle);
        self.pool.wait_for_completion(self.server_handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Ping {
        value: u32,
    }

    #[test]
    fn unknown_peer_send_fails() {
        let pool = Arc::new(Pool::new(0));
        let server = Server::new(pool, 0);
        let bogus = Endpoint::new("10.0.0.1", 1);
        let err = server.send(&Ping { value: 1 }, &bogus).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Policy);
    }

    #[test]
    fn accepts_connection_and_receives_a_frame() {
        // Bind on an OS-assigned port by going through the raw listener
        // first to learn the port, then constructing the Server on it.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let pool = Arc::new(Pool::new(0));
        let server = Server::new(pool, port);

        // Give the accept-loop task a moment to bind before connecting.
        std::thread::sleep(Duration::from_millis(50));

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let payload = crate::wire::serialize(&Ping { value: 42 }).unwrap();
        stream.write_all(&payload).unwrap();

        let mut source = None;
        let msg: Ping = server
            .receive_timed(Duration::from_secs(3), &mut source)
            .expect("expected a frame");
        assert_eq!(msg.value, 42);
        assert!(source.is_some());

        let _ = stream.read(&mut [0u8; 1]);
    }
}
