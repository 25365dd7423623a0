use std::io::{ErrorKind as IoErrorKind, Read};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::communication::{Endpoint, ReceiveQueueMessage};
use crate::pool::{Status, Task};
use crate::queue::Queue;

/// Size of the fixed buffer used for each individual `recv()` call.
const RECEIVE_CHUNK_SIZE: usize = 1024;

/// Socket read timeout. Bounds how long a single `run_atomic` call can
/// block, so cancellation latency stays bounded.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Pool task that owns one socket's receive loop, pushing every raw read
/// onto a shared receive queue.
pub struct ReceiverTask {
    socket: TcpStream,
    endpoint: Endpoint,
    receive_queue: Arc<Queue<ReceiveQueueMessage>>,
}

impl ReceiverTask {
    pub fn new(
        socket: TcpStream,
        receive_queue: Arc<Queue<ReceiveQueueMessage>>,
        endpoint: Endpoint,
    ) -> Self {
        ReceiverTask {
            socket,
            endpoint,
            receive_queue,
        }
    }

    /// The raw file descriptor, so the owning Client/Server can close it
    /// once this task (and its paired sender) has exited.
    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl Task for ReceiverTask {
    fn set_up(&mut self) -> Status {
        match self.socket.set_read_timeout(Some(READ_TIMEOUT)) {
            Ok(()) => Status::Running,
            Err(e) => {
                warn!(error = %e, "failed to set receiver socket read timeout");
                Status::Failed
            }
        }
    }

    fn run_atomic(&mut self) -> Status {
        let mut buf = [0u8; RECEIVE_CHUNK_SIZE];
        match self.socket.read(&mut buf) {
            Ok(0) => {
                // Peer closed the connection.
                self.receive_queue.push(ReceiveQueueMessage {
                    payload: Vec::new(),
                    endpoint: self.endpoint.clone(),
                    status: 0,
                });
                Status::Failed
            }
            Ok(n) => {
                self.receive_queue.push(ReceiveQueueMessage {
                    payload: buf[..n].to_vec(),
                    endpoint: self.endpoint.clone(),
                    status: n as i32,
                });
                Status::Running
            }
            Err(e) if e.kind() == IoErrorKind::WouldBlock || e.kind() == IoErrorKind::TimedOut => {
                // Merely a timeout; try again on the next iteration.
                Status::Running
            }
            Err(e) => {
                warn!(error = %e, "receiver task socket error");
                self.receive_queue.push(ReceiveQueueMessage {
                    payload: Vec::new(),
                    endpoint: self.endpoint.clone(),
                    status: -1,
                });
                Status::Failed
            }
        }
    }
}
