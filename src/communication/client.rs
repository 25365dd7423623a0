use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::communication::tasks::{ReceiverTask, SenderTask};
use crate::communication::{Endpoint, MessageId, Node, SendQueueMessage};
use crate::error::{Error, ErrorKind, Result, ResultWrappedExt};
use crate::pool::{Handle, Pool, Task};
use crate::queue::Queue;

/// Grace period for draining the send queue before a forced cancellation
/// on drop.
const SEND_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Per-`MessageId` outcome slots. Each synchronous `send` registers a
/// one-shot channel here before enqueueing its frame; the `SenderTask`'s
/// write callback completes it and the map entry is removed the moment it
/// is read, so no outcome can leak into a later, unrelated `send`.
type PendingSends = Mutex<HashMap<MessageId, oneshot::Sender<i32>>>;

/// Maintains a single outbound connection to `destination`, multiplexing
/// synchronous and fire-and-forget sends plus framed receives over it.
pub struct Client {
    node: Node,
    pool: Arc<Pool>,
    endpoint: Endpoint,
    send_queue: Arc<Queue<SendQueueMessage>>,
    sender_handle: Mutex<Option<Handle>>,
    receiver_handle: Mutex<Option<Handle>>,
    message_id: AtomicU64,
    pending: Arc<PendingSends>,
}

impl Client {
    pub fn new(pool: Arc<Pool>, destination: Endpoint) -> Self {
        Client {
            node: Node::new(Arc::clone(&pool)),
            pool,
            endpoint: destination,
            send_queue: Arc::new(Queue::new(0)),
            sender_handle: Mutex::new(None),
            receiver_handle: Mutex::new(None),
            message_id: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Eagerly opens the underlying connection, if not already open.
    /// `send`/`send_async` do this lazily on first use; callers that need
    /// the socket live immediately (e.g. the coordinator, which opens its
    /// outbound connection to a participant at `Register` time) can call
    /// this directly.
    pub fn connect(&self) -> Result<()> {
        self.ensure_connected()
    }

    /// Serializes and sends `message`, blocking until the write completes
    /// (or fails). Returns the byte count written, or a negative value on
    /// failure, matching the underlying `send()` result convention.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<i32> {
        self.ensure_connected()?;

        let id = self.next_message_id();
        let payload = crate::wire::serialize(message)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        self.send_queue.push(SendQueueMessage {
            id,
            payload,
            is_async: false,
        });

        rx.recv().map_err(|_| Error::simple(ErrorKind::Transport))
    }

    /// Serializes and enqueues `message` without waiting for the write to
    /// complete. Errors in the eventual send are not reported.
    pub fn send_async<T: Serialize>(&self, message: &T) -> Result<()> {
        self.ensure_connected()?;

        let id = self.next_message_id();
        let payload = crate::wire::serialize(message)?;

        self.send_queue.push(SendQueueMessage {
            id,
            payload,
            is_async: true,
        });

        Ok(())
    }

    /// Blocks waiting for the next framed message from this connection.
    pub fn receive<T: DeserializeOwned>(&self) -> Option<T> {
        self.ensure_connected().ok()?;
        let mut source = Some(self.endpoint.clone());
        self.node.receive(&mut source)
    }

    /// As [`receive`](Client::receive), but gives up after `timeout`.
    pub fn receive_timed<T: DeserializeOwned>(&self, timeout: Duration) -> Option<T> {
        self.ensure_connected().ok()?;
        let mut source = Some(self.endpoint.clone());
        self.node.receive_timed(timeout, &mut source)
    }

    fn next_message_id(&self) -> MessageId {
        self.message_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn ensure_connected(&self) -> Result<()> {
        let mut sender_handle = self.sender_handle.lock();
        if sender_handle.is_some() {
            return Ok(());
        }

        info!(endpoint = %self.endpoint, "connecting");
        let stream = TcpStream::connect((self.endpoint.hostname.as_str(), self.endpoint.port))
            .wrapped(ErrorKind::Resource)?;
        let receiver_stream = stream.try_clone().wrapped(ErrorKind::Resource)?;

        let pending = Arc::clone(&self.pending);
        let sender = SenderTask::new(
            stream,
            Arc::clone(&self.send_queue),
            Box::new(move |id, status| {
                if let Some(tx) = pending.lock().remove(&id) {
                    let _ = tx.send(status);
                }
            }),
        );
        let receiver = ReceiverTask::new(
            receiver_stream,
            Arc::clone(self.node.receive_queue()),
            self.endpoint.clone(),
        );

        *sender_handle = Some(self.pool.add_task(Box::new(sender) as Box<dyn Task>));
        *self.receiver_handle.lock() = Some(self.pool.add_task(Box::new(receiver) as Box<dyn Task>));

        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        info!("waiting for pending sends to finish");
        if !self.send_queue.wait_empty(Some(SEND_DRAIN_GRACE)) {
            tracing::warn!("send operations did not complete in time");
        }

        if let Some(handle) = self.sender_handle.lock().take() {
            self.pool.cancel_task(handle);
            self.pool.wait_for_completion(handle);
        }
        if let Some(handle) = self.receiver_handle.lock().take() {
            self.pool.cancel_task(handle);
            self.pool.wait_for_completion(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn send_returns_bytes_written() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let pool = Arc::new(Pool::new(0));
        let client = Client::new(Arc::clone(&pool), Endpoint::new("127.0.0.1", addr.port()));

        let accepted = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).unwrap();
            buf[..n].to_vec()
        });

        #[derive(serde::Serialize)]
        struct Ping {
            value: u32,
        }

        let result = client.send(&Ping { value: 7 }).unwrap();
        assert!(result > 0);
        let received = accepted.join().unwrap();
        assert!(!received.is_empty());
    }

    #[test]
    fn send_async_does_not_block_on_result() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _keep_alive = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(b"ok");
        });

        let pool = Arc::new(Pool::new(0));
        let client = Client::new(pool, Endpoint::new("127.0.0.1", addr.port()));

        #[derive(serde::Serialize)]
        struct Ping;

        client.send_async(&Ping).unwrap();
    }

    #[test]
    fn two_sequential_sends_each_get_their_own_result() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let accepted = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).unwrap();
            let _ = stream.read(&mut buf).unwrap();
        });

        let pool = Arc::new(Pool::new(0));
        let client = Client::new(pool, Endpoint::new("127.0.0.1", addr.port()));

        #[derive(serde::Serialize)]
        struct Ping {
            value: u32,
        }

        let first = client.send(&Ping { value: 1 }).unwrap();
        let second = client.send(&Ping { value: 2 }).unwrap();
        assert!(first > 0);
        assert!(second > 0);

        accepted.join().unwrap();
    }
}
