//! Message-passing layer: a shared socket endpoint type, the queue message
//! shapes that cross between tasks and the application, and the `Node`
//! receive algorithm shared by `Client` and `Server`.

pub mod client;
pub mod server;
pub mod tasks;

pub use client::Client;
pub use server::Server;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::pool::Pool;
use crate::queue::Queue;
use crate::wire::MessageParser;

/// A (hostname, port) pair identifying a peer. Equality and hashing are by
/// both fields; this type is never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub hostname: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Endpoint {
            hostname: hostname.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// Process-local monotone identifier correlating a dispatched send with its
/// eventual outcome.
pub type MessageId = u64;

/// One raw read off a socket, handed from a `ReceiverTask` to whoever is
/// consuming its receive queue.
///
/// `status > 0` carries that many valid bytes in `payload`; `status == 0`
/// signals the peer closed the connection; `status < 0` signals an I/O
/// error. Both sentinel cases carry an empty payload.
#[derive(Debug, Clone)]
pub struct ReceiveQueueMessage {
    pub payload: Vec<u8>,
    pub endpoint: Endpoint,
    pub status: i32,
}

/// A message queued for a `SenderTask` to write to its socket.
#[derive(Debug, Clone)]
pub struct SendQueueMessage {
    pub id: MessageId,
    pub payload: Vec<u8>,
    pub is_async: bool,
}

/// Shared superclass behavior for anything that receives framed messages
/// off a `ReceiverTask`'s queue: `Client` and `Server` both embed one.
pub struct Node {
    pool: Arc<Pool>,
    receive_queue: Arc<Queue<ReceiveQueueMessage>>,
    unprocessed: parking_lot::Mutex<VecDeque<ReceiveQueueMessage>>,
}

impl Node {
    pub fn new(pool: Arc<Pool>) -> Self {
        Node {
            pool,
            receive_queue: Arc::new(Queue::new(0)),
            unprocessed: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn receive_queue(&self) -> &Arc<Queue<ReceiveQueueMessage>> {
        &self.receive_queue
    }

    /// Receives and decodes the next message, blocking indefinitely.
    pub fn receive<T: DeserializeOwned>(&self, source: &mut Option<Endpoint>) -> Option<T> {
        self.do_receive(|| Some(self.receive_queue.pop()), source)
    }

    /// Receives and decodes the next message, waiting at most `timeout`.
    pub fn receive_timed<T: DeserializeOwned>(
        &self,
        timeout: Duration,
        source: &mut Option<Endpoint>,
    ) -> Option<T> {
        self.do_receive(|| self.receive_queue.pop_timed(timeout), source)
    }

    /// Core receive algorithm shared by the timed and untimed variants.
    ///
    /// Drains previously-buffered off-endpoint messages first, fixes the
    /// conversation's endpoint to the first frame seen, and requeues (never
    /// drops) frames that arrive from a different peer in the meantime so
    /// that fairness across peers is preserved.
    fn do_receive<T, F>(&self, mut pop_queue: F, source: &mut Option<Endpoint>) -> Option<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> Option<ReceiveQueueMessage>,
    {
        let mut parser = MessageParser::<T>::new();

        let mut pending: VecDeque<ReceiveQueueMessage> = {
            let mut guard = self.unprocessed.lock();
            std::mem::take(&mut *guard)
        };

        let mut reading_endpoint: Option<Endpoint> = None;

        while !parser.has_complete_message() {
            let response = if let Some(msg) = pending.pop_front() {
                msg
            } else {
                pop_queue()?
            };

            match &reading_endpoint {
                None => reading_endpoint = Some(response.endpoint.clone()),
                Some(endpoint) if *endpoint != response.endpoint => {
                    let mut guard = self.unprocessed.lock();
                    guard.push_back(response);
                    continue;
                }
                Some(_) => {}
            }

            if response.status <= 0 {
                return None;
            }

            parser.feed(&response.payload);
        }

        let reading_endpoint = reading_endpoint.expect("loop always sets this before exiting");
        if let Some(dst) = source {
            *dst = reading_endpoint.clone();
        } else {
            *source = Some(reading_endpoint.clone());
        }

        if parser.has_overflow() {
            let overflow = parser.take_overflow();
            let len = overflow.len() as i32;
            let mut guard = self.unprocessed.lock();
            guard.push_back(ReceiveQueueMessage {
                payload: overflow,
                endpoint: reading_endpoint,
                status: len,
            });
        }

        parser.take_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::tasks::receiver::ReceiverTask;
    use crate::pool::{Pool, Task};
    use serde::{Deserialize, Serialize};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
    struct TestResponse {
        parameter: String,
    }

    #[test]
    fn back_to_back_receive_on_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client_stream = TcpStream::connect(addr).unwrap();
        let (server_stream, peer_addr) = listener.accept().unwrap();

        let mut combined = crate::wire::serialize(&TestResponse {
            parameter: "a parameter string value".to_owned(),
        })
        .unwrap();
        combined.extend(
            crate::wire::serialize(&TestResponse {
                parameter: "a parameter string value".to_owned(),
            })
            .unwrap(),
        );
        use std::io::Write;
        (&client_stream).write_all(&combined).unwrap();

        let pool = Arc::new(Pool::new(0));
        let node = Node::new(Arc::clone(&pool));
        let endpoint = Endpoint::new(peer_addr.ip().to_string(), peer_addr.port());
        let receiver = ReceiverTask::new(
            server_stream.try_clone().unwrap(),
            Arc::clone(node.receive_queue()),
            endpoint.clone(),
        );
        let handle = pool.add_task(Box::new(receiver) as Box<dyn Task>);

        for _ in 0..2 {
            let mut source = None;
            let msg: TestResponse = node.receive(&mut source).unwrap();
            assert_eq!(msg.parameter, "a parameter string value");
            assert_eq!(source.unwrap(), endpoint);
        }

        pool.cancel_task(handle);
    }
}
