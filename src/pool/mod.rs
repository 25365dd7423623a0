//! A task-oriented thread pool with an explicit `set_up / run_atomic /
//! clean_up` lifecycle, cooperative cancellation and bounded concurrency.
//!
//! Unlike a conventional "fire a closure" thread pool, tasks here are
//! long-lived state machines: a worker thread calls `run_atomic` repeatedly
//! until the task reports it is done, failed, or has been cancelled between
//! iterations. This matches the way the rest of the crate drives sockets:
//! a `SenderTask`/`ReceiverTask` is one `run_atomic` loop per connection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, info_span};

/// Opaque identifier for a task handed out by [`Pool::add_task`].
pub type Handle = u32;

/// Observable lifecycle status of a task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// The task is still running (or has not yet been dispatched).
    Running,
    /// The task completed its work normally.
    Done,
    /// `run_atomic` reported a failure.
    Failed,
    /// The task was cancelled between iterations.
    Cancelled,
}

impl Status {
    fn is_terminal(self) -> bool {
        !matches!(self, Status::Running)
    }
}

/// A unit of cooperatively-scheduled work. Implementors own whatever
/// resource (typically a socket FD) the task is responsible for; the pool
/// guarantees `clean_up` runs exactly once, after the last `run_atomic`
/// call, before the handle is ever reported as joined.
pub trait Task: Send {
    /// One-time setup. Returning `Status::Failed` skips `run_atomic`
    /// entirely but `clean_up` still runs.
    fn set_up(&mut self) -> Status {
        Status::Running
    }

    /// Runs one iteration of the task's main loop. Cancellation is only
    /// observed by the pool between calls to this method, so any blocking
    /// operation performed here should use a bounded timeout.
    fn run_atomic(&mut self) -> Status;

    /// Called unconditionally once the task reaches a terminal status.
    fn clean_up(&mut self) {}
}

enum DispatchMsg {
    Task(Handle),
    Shutdown,
}

enum JoinMsg {
    Completed(Handle),
    Shutdown,
}

struct Bookkeeping {
    tasks: HashMap<Handle, Arc<Mutex<Box<dyn Task>>>>,
    status: HashMap<Handle, Status>,
    threads: HashMap<Handle, JoinHandle<()>>,
    cancelled: HashSet<Handle>,
    pool_size: u32,
    num_completed: u64,
}

struct State {
    max_threads: u32,
    bookkeeping: Mutex<Bookkeeping>,
    task_done: Condvar,
    thread_available: Condvar,
    dispatch_tx: Sender<DispatchMsg>,
    joinable_tx: Sender<JoinMsg>,
}

impl State {
    fn publish_status(&self, handle: Handle, status: Status) {
        let mut bk = self.bookkeeping.lock();
        bk.status.insert(handle, status);
    }

    fn is_cancelled(&self, handle: Handle) -> bool {
        self.bookkeeping.lock().cancelled.contains(&handle)
    }
}

/// A thread pool that schedules [`Task`]s through their full lifecycle.
pub struct Pool {
    state: Arc<State>,
    next_handle: AtomicU32,
    dispatcher: Option<JoinHandle<()>>,
    joiner: Option<JoinHandle<()>>,
}

impl Pool {
    /// Creates a pool. `max_threads == 0` means unbounded concurrency.
    pub fn new(max_threads: u32) -> Self {
        let (dispatch_tx, dispatch_rx) = unbounded();
        let (joinable_tx, joinable_rx) = unbounded();

        let state = Arc::new(State {
            max_threads,
            bookkeeping: Mutex::new(Bookkeeping {
                tasks: HashMap::new(),
                status: HashMap::new(),
                threads: HashMap::new(),
                cancelled: HashSet::new(),
                pool_size: 0,
                num_completed: 0,
            }),
            task_done: Condvar::new(),
            thread_available: Condvar::new(),
            dispatch_tx,
            joinable_tx,
        });

        let dispatcher = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || dispatcher_thread(state, dispatch_rx))
        };
        let joiner = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || joiner_thread(state, joinable_rx))
        };

        Pool {
            state,
            next_handle: AtomicU32::new(1),
            dispatcher: Some(dispatcher),
            joiner: Some(joiner),
        }
    }

    /// Submits a task and returns a handle used to query or cancel it.
    pub fn add_task(&self, task: Box<dyn Task>) -> Handle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        {
            let mut bk = self.state.bookkeeping.lock();
            bk.tasks.insert(handle, Arc::new(Mutex::new(task)));
            bk.status.insert(handle, Status::Running);
        }
        // If the pool is already shutting down this send fails silently;
        // the task simply never runs, matching "no new work after close".
        let _ = self.state.dispatch_tx.send(DispatchMsg::Task(handle));
        handle
    }

    /// Requests cancellation. Takes effect at the next iteration boundary
    /// (or immediately, if the task has not yet been dispatched).
    pub fn cancel_task(&self, handle: Handle) {
        let mut bk = self.state.bookkeeping.lock();
        bk.cancelled.insert(handle);
    }

    /// Returns the current status of `handle`, or `None` if unknown.
    pub fn get_status(&self, handle: Handle) -> Option<Status> {
        self.state.bookkeeping.lock().status.get(&handle).copied()
    }

    /// Blocks until `handle` reaches a terminal status.
    pub fn wait_for_completion(&self, handle: Handle) {
        let mut bk = self.state.bookkeeping.lock();
        loop {
            match bk.status.get(&handle) {
                Some(status) if status.is_terminal() => return,
                None => return,
                _ => {}
            }
            self.state.task_done.wait(&mut bk);
        }
    }

    /// Blocks until at least one currently-non-terminal task transitions to
    /// a terminal state, or returns immediately if the pool is idle.
    pub fn wait_for_any_completion(&self) {
        let mut bk = self.state.bookkeeping.lock();
        let starting_completed = bk.num_completed;
        if bk.status.values().all(|s| s.is_terminal()) {
            return;
        }
        while bk.num_completed == starting_completed {
            self.state.task_done.wait(&mut bk);
        }
    }

    /// Current number of live worker threads.
    pub fn num_threads(&self) -> u32 {
        self.state.bookkeeping.lock().pool_size
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        {
            let mut bk = self.state.bookkeeping.lock();
            let pending: Vec<Handle> = bk
                .status
                .iter()
                .filter(|(_, s)| !s.is_terminal())
                .map(|(&h, _)| h)
                .collect();
            for handle in pending {
                bk.cancelled.insert(handle);
            }
        }
        self.state.thread_available.notify_all();

        // Wait for every outstanding task to reach a terminal state before
        // tearing down the service threads, so no worker is left running
        // unattended.
        {
            let mut bk = self.state.bookkeeping.lock();
            while !bk.status.values().all(|s| s.is_terminal()) {
                self.state.task_done.wait(&mut bk);
            }
        }

        let _ = self.state.dispatch_tx.send(DispatchMsg::Shutdown);
        let _ = self.state.joinable_tx.send(JoinMsg::Shutdown);

        if let Some(t) = self.dispatcher.take() {
            let _ = t.join();
        }
        if let Some(t) = self.joiner.take() {
            let _ = t.join();
        }
    }
}

fn dispatcher_thread(state: Arc<State>, dispatch_rx: Receiver<DispatchMsg>) {
    loop {
        match dispatch_rx.recv() {
            Ok(DispatchMsg::Task(handle)) => {
                wait_for_free_slot(&state);
                spawn_worker(&state, handle);
            }
            Ok(DispatchMsg::Shutdown) | Err(_) => {
                debug!("dispatcher thread exiting");
                return;
            }
        }
    }
}

fn wait_for_free_slot(state: &Arc<State>) {
    if state.max_threads == 0 {
        return;
    }
    let mut bk = state.bookkeeping.lock();
    while bk.pool_size >= state.max_threads {
        state.thread_available.wait(&mut bk);
    }
}

fn spawn_worker(state: &Arc<State>, handle: Handle) {
    let task = {
        let mut bk = state.bookkeeping.lock();
        bk.pool_size += 1;
        match bk.tasks.get(&handle) {
            Some(t) => Arc::clone(t),
            None => {
                bk.pool_size -= 1;
                return;
            }
        }
    };

    let worker_state = Arc::clone(state);
    let join_handle = std::thread::spawn(move || run_task(worker_state, handle, task));

    let mut bk = state.bookkeeping.lock();
    bk.threads.insert(handle, join_handle);
}

fn run_task(state: Arc<State>, handle: Handle, task: Arc<Mutex<Box<dyn Task>>>) {
    let span = info_span!("task", handle);
    let _guard = span.enter();

    let mut status = if state.is_cancelled(handle) {
        Status::Cancelled
    } else {
        let mut task = task.lock();
        let mut status = task.set_up();
        if status != Status::Failed {
            loop {
                status = task.run_atomic();
                if matches!(status, Status::Done | Status::Failed) {
                    break;
                }
                if state.is_cancelled(handle) {
                    status = Status::Cancelled;
                    break;
                }
            }
        }
        status
    };

    if status == Status::Running {
        // Defensive: run_atomic must resolve to a terminal status via the
        // loop above; this arm only guards against a misbehaving Task.
        status = Status::Failed;
    }

    task.lock().clean_up();

    if status == Status::Failed {
        info!(handle, "task failed");
    }

    state.publish_status(handle, status);
    let _ = state.joinable_tx.send(JoinMsg::Completed(handle));
}

fn joiner_thread(state: Arc<State>, joinable_rx: Receiver<JoinMsg>) {
    loop {
        match joinable_rx.recv() {
            Ok(JoinMsg::Completed(handle)) => {
                let join_handle = {
                    let mut bk = state.bookkeeping.lock();
                    bk.threads.remove(&handle)
                };
                if let Some(join_handle) = join_handle {
                    let _ = join_handle.join();
                }
                let mut bk = state.bookkeeping.lock();
                bk.pool_size = bk.pool_size.saturating_sub(1);
                bk.num_completed += 1;
                // Drop the pool's own reference to the task now that its
                // worker thread has been joined. If this was the last
                // reference, the task (and whatever socket FD it owned) is
                // dropped here, after clean_up has returned — never before.
                let task = bk.tasks.remove(&handle);
                bk.cancelled.remove(&handle);
                drop(bk);
                drop(task);
                state.thread_available.notify_one();
                state.task_done.notify_all();
            }
            Ok(JoinMsg::Shutdown) | Err(_) => {
                debug!("joiner thread exiting");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    struct Counting {
        value: i32,
        result: Arc<Mutex<Option<i32>>>,
    }

    impl Task for Counting {
        fn run_atomic(&mut self) -> Status {
            *self.result.lock() = Some(self.value + 2);
            Status::Done
        }
    }

    struct Infinite {
        cleaned_up: Arc<AtomicBool>,
    }

    impl Task for Infinite {
        fn run_atomic(&mut self) -> Status {
            std::thread::sleep(Duration::from_millis(10));
            Status::Running
        }

        fn clean_up(&mut self) {
            self.cleaned_up.store(true, Ordering::SeqCst);
        }
    }

    struct FailsSetUp;

    impl Task for FailsSetUp {
        fn set_up(&mut self) -> Status {
            Status::Failed
        }

        fn run_atomic(&mut self) -> Status {
            panic!("run_atomic must not be called after SetUp fails");
        }
    }

    #[test]
    fn basic_task_completes_with_result() {
        let pool = Pool::new(0);
        let result = Arc::new(Mutex::new(None));
        let handle = pool.add_task(Box::new(Counting {
            value: 2,
            result: Arc::clone(&result),
        }));
        pool.wait_for_completion(handle);
        assert_eq!(pool.get_status(handle), Some(Status::Done));
        assert_eq!(*result.lock(), Some(4));
    }

    #[test]
    fn cancelling_infinite_task_converges_to_cancelled() {
        let pool = Pool::new(0);
        let cleaned_up = Arc::new(AtomicBool::new(false));
        let handle = pool.add_task(Box::new(Infinite {
            cleaned_up: Arc::clone(&cleaned_up),
        }));
        std::thread::sleep(Duration::from_millis(30));
        pool.cancel_task(handle);
        pool.wait_for_completion(handle);
        assert_eq!(pool.get_status(handle), Some(Status::Cancelled));
        assert!(cleaned_up.load(Ordering::SeqCst));
    }

    #[test]
    fn set_up_failure_skips_run_atomic_but_still_cleans_up() {
        let pool = Pool::new(0);
        let handle = pool.add_task(Box::new(FailsSetUp));
        pool.wait_for_completion(handle);
        assert_eq!(pool.get_status(handle), Some(Status::Failed));
    }

    #[test]
    fn bounded_pool_caps_concurrency() {
        let pool = Pool::new(2);
        let handles: Vec<_> = (0..3)
            .map(|_| {
                pool.add_task(Box::new(Infinite {
                    cleaned_up: Arc::new(AtomicBool::new(false)),
                }))
            })
            .collect();

        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(10));
            assert!(pool.num_threads() <= 2);
        }

        for handle in handles {
            pool.cancel_task(handle);
        }
    }
}
