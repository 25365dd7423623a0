use std::io::Write;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::communication::{MessageId, SendQueueMessage};
use crate::pool::{Status, Task};
use crate::queue::Queue;

/// How long to wait for a new message on the send queue before looping
/// again to check for cancellation.
const QUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Callback invoked with a message's id and the result of attempting to
/// write it (positive byte count, 0 for peer close, negative for error).
pub type SendCallback = Box<dyn Fn(MessageId, i32) + Send>;

/// Pool task that owns one socket's send loop, draining a shared send
/// queue and writing each message in turn.
pub struct SenderTask {
    socket: TcpStream,
    send_queue: Arc<Queue<SendQueueMessage>>,
    callback: SendCallback,
}

impl SenderTask {
    pub fn new(
        socket: TcpStream,
        send_queue: Arc<Queue<SendQueueMessage>>,
        callback: SendCallback,
    ) -> Self {
        SenderTask {
            socket,
            send_queue,
            callback,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl Task for SenderTask {
    fn run_atomic(&mut self) -> Status {
        let message = match self.send_queue.pop_timed(QUEUE_TIMEOUT) {
            Some(m) => m,
            None => return Status::Running,
        };

        match self.socket.write(&message.payload) {
            Ok(n) => {
                if !message.is_async {
                    (self.callback)(message.id, n as i32);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                info!(id = message.id, "send timed out, will retry");
                self.send_queue.push(message);
            }
            Err(e) => {
                warn!(error = %e, "socket error sending message");
                if !message.is_async {
                    (self.callback)(message.id, -1);
                }
            }
        }

        Status::Running
    }
}
