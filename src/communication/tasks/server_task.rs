use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::communication::tasks::{ReceiverTask, SenderTask};
use crate::communication::{Endpoint, MessageId, ReceiveQueueMessage, SendQueueMessage};
use crate::pool::{Handle, Pool, Status, Task};
use crate::queue::Queue;

/// Interval between non-blocking `accept()` polls. Bounds cancellation
/// latency in lieu of a portable blocking-accept-with-timeout.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Called once per accepted connection with its endpoint and the send
/// queue the caller should address it through.
pub type NewClientCallback =
    Box<dyn Fn(Endpoint, Arc<Queue<SendQueueMessage>>) + Send>;

/// The sender/receiver's socket FDs are never closed by raw fd number here:
/// each task owns its own `TcpStream` (the receiver holds the accepted
/// stream, the sender a `try_clone` of it), and the pool drops a task's
/// resources — including its socket — only once the task has been joined,
/// which is exactly "after clean_up has returned". A second, explicit
/// `libc::close` on top of that would race the FD being recycled by the OS
/// for an unrelated socket; see the ownership discipline in the crate docs.
struct ChildTask {
    sender_handle: Handle,
    receiver_handle: Handle,
}

/// Pool task implementing the accept loop: for every new connection it
/// spins up a dedicated sender/receiver task pair and hands the send queue
/// back to the owning `Server` via `new_client_callback`.
pub struct ServerTask {
    listen_port: u16,
    listener: Option<TcpListener>,
    pool: Arc<Pool>,
    receive_queue: Arc<Queue<ReceiveQueueMessage>>,
    new_client_callback: NewClientCallback,
    send_callback: Arc<dyn Fn(MessageId, i32) + Send + Sync>,
    children: Mutex<Vec<ChildTask>>,
}

impl ServerTask {
    pub fn new(
        listen_port: u16,
        pool: Arc<Pool>,
        receive_queue: Arc<Queue<ReceiveQueueMessage>>,
        new_client_callback: NewClientCallback,
        send_callback: Arc<dyn Fn(MessageId, i32) + Send + Sync>,
    ) -> Self {
        ServerTask {
            listen_port,
            listener: None,
            pool,
            receive_queue,
            new_client_callback,
            send_callback,
            children: Mutex::new(Vec::new()),
        }
    }

    fn close_disconnected(&self) {
        let mut children = self.children.lock();
        children.retain(|child| {
            let sender_running = matches!(
                self.pool.get_status(child.sender_handle),
                Some(Status::Running) | None
            );
            let receiver_running = matches!(
                self.pool.get_status(child.receiver_handle),
                Some(Status::Running) | None
            );
            if sender_running && receiver_running {
                true
            } else {
                info!(
                    sender = child.sender_handle,
                    receiver = child.receiver_handle,
                    "client disconnected"
                );
                false
            }
        });
    }
}

impl Task for ServerTask {
    fn set_up(&mut self) -> Status {
        match TcpListener::bind(("0.0.0.0", self.listen_port)) {
            Ok(listener) => {
                if listener.set_nonblocking(true).is_err() {
                    return Status::Failed;
                }
                self.listener = Some(listener);
                Status::Running
            }
            Err(e) => {
                warn!(error = %e, port = self.listen_port, "failed to bind listener");
                Status::Failed
            }
        }
    }

    fn run_atomic(&mut self) -> Status {
        self.close_disconnected();

        let listener = match &self.listener {
            Some(l) => l,
            None => return Status::Failed,
        };

        match listener.accept() {
            Ok((stream, addr)) => {
                let endpoint = Endpoint::new(addr.ip().to_string(), addr.port());

                let send_queue = Arc::new(Queue::new(0));
                let send_callback = Arc::clone(&self.send_callback);
                let sender_stream = match stream.try_clone() {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, "failed to clone accepted stream");
                        return Status::Running;
                    }
                };
                let sender = SenderTask::new(
                    sender_stream,
                    Arc::clone(&send_queue),
                    Box::new(move |id, status| (send_callback)(id, status)),
                );
                let receiver = ReceiverTask::new(
                    stream,
                    Arc::clone(&self.receive_queue),
                    endpoint.clone(),
                );

                let sender_handle = self.pool.add_task(Box::new(sender));
                let receiver_handle = self.pool.add_task(Box::new(receiver));

                self.children.lock().push(ChildTask {
                    sender_handle,
                    receiver_handle,
                });

                (self.new_client_callback)(endpoint, send_queue);

                Status::Running
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
                Status::Running
            }
            Err(e) => {
                warn!(error = %e, "accept() failed");
                Status::Failed
            }
        }
    }

    fn clean_up(&mut self) {
        let children = {
            let mut guard = self.children.lock();
            std::mem::take(&mut *guard)
        };

        info!(count = children.len(), "server task exiting, cancelling children");

        for child in &children {
            self.pool.cancel_task(child.sender_handle);
            self.pool.cancel_task(child.receiver_handle);
        }
        for child in &children {
            self.pool.wait_for_completion(child.sender_handle);
            self.pool.wait_for_completion(child.receiver_handle);
        }
        // Both tasks have been joined; the pool has already dropped their
        // owned sockets, closing the underlying FDs. Nothing left to close
        // here by hand.

        self.listener.take();
    }
}
