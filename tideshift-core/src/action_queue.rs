//! Single-threaded FIFO of deferred actions.
//!
//! Used to move slow or blocking work, such as tearing down a buffer, off the
//! caller's task. Each action runs exactly once on a dedicated OS thread or
//! is cancelled; its completion always learns which.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Error returned by an action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    /// The action reported a failure
    #[error("Action failed: {0}")]
    Failed(String),

    /// The action panicked
    #[error("Action panicked: {0}")]
    Panicked(String),
}

/// Terminal state of a queued action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionStatus {
    Completed,
    Cancelled,
    Failed(ActionError),
}

/// Errors raised by the queue itself.
#[derive(Debug, thiserror::Error)]
pub enum ActionQueueError {
    /// The worker thread has exited
    #[error("Action queue '{name}' is not running")]
    NotRunning {
        /// Queue name
        name: String,
    },

    /// The worker thread could not be started
    #[error("Cannot start action queue '{name}': {source}")]
    Spawn {
        /// Queue name
        name: String,
        /// Thread creation failure
        #[source]
        source: std::io::Error,
    },
}

type Action = Box<dyn FnOnce() -> Result<(), ActionError> + Send>;
type Completion = Box<dyn FnOnce(ActionStatus) + Send>;

enum Item {
    Task {
        seq: u64,
        action: Action,
        completion: Completion,
    },
    /// Unblocks the worker so it can observe `will_stop`
    Wake,
}

impl Item {
    fn cancel(self) {
        if let Item::Task { completion, .. } = self {
            complete(completion, ActionStatus::Cancelled);
        }
    }
}

#[derive(Default)]
struct Flags {
    will_stop: AtomicBool,
    /// Sequence number handed to the next queued action
    next_seq: AtomicU64,
    /// Actions numbered below this are cancelled when dequeued
    cancel_mark: AtomicU64,
}

/// FIFO of actions drained by one named worker thread.
pub struct ActionQueue {
    name: String,
    sender: mpsc::UnboundedSender<Item>,
    flags: Arc<Flags>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ActionQueue {
    /// Starts the worker thread.
    ///
    /// # Errors
    ///
    /// - `ActionQueueError::Spawn` - If the OS refuses to create the thread
    pub fn start(name: impl Into<String>) -> Result<Self, ActionQueueError> {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let flags = Arc::new(Flags::default());

        let worker = {
            let flags = Arc::clone(&flags);
            let thread_name = name.clone();
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || run_worker(&thread_name, receiver, &flags))
                .map_err(|source| ActionQueueError::Spawn {
                    name: name.clone(),
                    source,
                })?
        };

        debug!("Action queue '{}' started", name);
        Ok(Self {
            name,
            sender,
            flags,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues `action`; `completion` receives its terminal status.
    ///
    /// A queue that is stopping cancels the action immediately.
    ///
    /// # Errors
    ///
    /// - `ActionQueueError::NotRunning` - If the worker has exited; the
    ///   completion has already received `Cancelled`
    pub fn perform_async<A, C>(&self, action: A, completion: C) -> Result<(), ActionQueueError>
    where
        A: FnOnce() -> Result<(), ActionError> + Send + 'static,
        C: FnOnce(ActionStatus) + Send + 'static,
    {
        let seq = self.flags.next_seq.fetch_add(1, Ordering::AcqRel);
        self.enqueue(seq, Box::new(action), Box::new(completion))
    }

    /// Cancels everything queued so far, then queues `action`.
    ///
    /// # Errors
    ///
    /// - `ActionQueueError::NotRunning` - If the worker has exited
    pub fn cancel_all_before<A, C>(&self, action: A, completion: C) -> Result<(), ActionQueueError>
    where
        A: FnOnce() -> Result<(), ActionError> + Send + 'static,
        C: FnOnce(ActionStatus) + Send + 'static,
    {
        let seq = self.flags.next_seq.fetch_add(1, Ordering::AcqRel);
        self.flags.cancel_mark.fetch_max(seq, Ordering::AcqRel);
        self.enqueue(seq, Box::new(action), Box::new(completion))
    }

    /// Runs `action` on the worker and waits for its status.
    pub async fn perform<A>(&self, action: A) -> ActionStatus
    where
        A: FnOnce() -> Result<(), ActionError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let queued = self.perform_async(action, move |status| {
            let _ = tx.send(status);
        });
        if queued.is_err() {
            return ActionStatus::Cancelled;
        }
        rx.await.unwrap_or(ActionStatus::Cancelled)
    }

    /// Cancels queued actions and joins the worker thread.
    ///
    /// An action that is already running finishes first.
    pub fn stop(&self) {
        self.flags.will_stop.store(true, Ordering::Release);
        let _ = self.sender.send(Item::Wake);

        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            // Stopped from one of its own actions; the loop exits on its own
            return;
        }
        if worker.join().is_err() {
            error!("Action queue '{}' worker panicked", self.name);
        }
        debug!("Action queue '{}' stopped", self.name);
    }

    fn enqueue(
        &self,
        seq: u64,
        action: Action,
        completion: Completion,
    ) -> Result<(), ActionQueueError> {
        let item = Item::Task {
            seq,
            action,
            completion,
        };
        if self.flags.will_stop.load(Ordering::Acquire) {
            item.cancel();
            return Ok(());
        }
        self.send(item)
    }

    fn send(&self, item: Item) -> Result<(), ActionQueueError> {
        self.sender.send(item).map_err(|mpsc::error::SendError(item)| {
            item.cancel();
            ActionQueueError::NotRunning {
                name: self.name.clone(),
            }
        })
    }
}

impl Drop for ActionQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(name: &str, mut receiver: mpsc::UnboundedReceiver<Item>, flags: &Flags) {
    while let Some(item) = receiver.blocking_recv() {
        match item {
            Item::Wake => {
                if flags.will_stop.load(Ordering::Acquire) {
                    break;
                }
            }
            Item::Task {
                seq,
                action,
                completion,
            } => {
                if flags.will_stop.load(Ordering::Acquire)
                    || seq < flags.cancel_mark.load(Ordering::Acquire)
                {
                    complete(completion, ActionStatus::Cancelled);
                    continue;
                }
                let status = match panic::catch_unwind(AssertUnwindSafe(action)) {
                    Ok(Ok(())) => ActionStatus::Completed,
                    Ok(Err(e)) => {
                        debug!("Action on '{}' failed: {}", name, e);
                        ActionStatus::Failed(e)
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        warn!("Action on '{}' panicked: {}", name, message);
                        ActionStatus::Failed(ActionError::Panicked(message))
                    }
                };
                complete(completion, status);
            }
        }
    }

    receiver.close();
    while let Ok(item) = receiver.try_recv() {
        item.cancel();
    }
}

fn complete(completion: Completion, status: ActionStatus) {
    if panic::catch_unwind(AssertUnwindSafe(|| completion(status))).is_err() {
        warn!("Action completion panicked");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn reporter(
        tx: &std_mpsc::Sender<(&'static str, ActionStatus)>,
        label: &'static str,
    ) -> impl FnOnce(ActionStatus) + Send + 'static {
        let tx = tx.clone();
        move |status| {
            let _ = tx.send((label, status));
        }
    }

    /// Occupies the worker until the returned sender is used or dropped.
    fn block_worker(queue: &ActionQueue) -> std_mpsc::Sender<()> {
        let (release, gate) = std_mpsc::channel::<()>();
        let (started_tx, started_rx) = std_mpsc::channel();
        queue
            .perform_async(
                move || {
                    let _ = started_tx.send(());
                    let _ = gate.recv();
                    Ok(())
                },
                |_| {},
            )
            .unwrap();
        started_rx.recv_timeout(WAIT).unwrap();
        release
    }

    #[test]
    fn test_actions_run_in_order() {
        let queue = ActionQueue::start("order").unwrap();
        let (tx, rx) = std_mpsc::channel();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = Arc::clone(&seen);
            queue
                .perform_async(
                    move || {
                        seen.lock().push(i);
                        Ok(())
                    },
                    reporter(&tx, "task"),
                )
                .unwrap();
        }
        for _ in 0..5 {
            assert_eq!(rx.recv_timeout(WAIT).unwrap().1, ActionStatus::Completed);
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_failures_and_panics_reach_completion() {
        let queue = ActionQueue::start("failures").unwrap();
        let (tx, rx) = std_mpsc::channel();

        queue
            .perform_async(
                || Err(ActionError::Failed("disk full".to_string())),
                reporter(&tx, "fail"),
            )
            .unwrap();
        queue
            .perform_async(|| panic!("boom"), reporter(&tx, "panic"))
            .unwrap();
        queue.perform_async(|| Ok(()), reporter(&tx, "after")).unwrap();

        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            ("fail", ActionStatus::Failed(ActionError::Failed("disk full".to_string())))
        );
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            ("panic", ActionStatus::Failed(ActionError::Panicked("boom".to_string())))
        );
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            ("after", ActionStatus::Completed)
        );
    }

    #[test]
    fn test_cancel_all_before_cancels_queued_actions() {
        let queue = ActionQueue::start("drain").unwrap();
        let (tx, rx) = std_mpsc::channel();
        let release = block_worker(&queue);

        queue.perform_async(|| Ok(()), reporter(&tx, "a")).unwrap();
        queue.perform_async(|| Ok(()), reporter(&tx, "b")).unwrap();
        queue
            .cancel_all_before(|| Ok(()), reporter(&tx, "priority"))
            .unwrap();
        queue.perform_async(|| Ok(()), reporter(&tx, "later")).unwrap();
        release.send(()).unwrap();

        let results: Vec<_> = (0..4).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(
            results,
            vec![
                ("a", ActionStatus::Cancelled),
                ("b", ActionStatus::Cancelled),
                ("priority", ActionStatus::Completed),
                ("later", ActionStatus::Completed),
            ]
        );
    }

    #[test]
    fn test_repeated_cancel_all_before_keeps_only_latest() {
        let queue = ActionQueue::start("drain-twice").unwrap();
        let (tx, rx) = std_mpsc::channel();
        let release = block_worker(&queue);

        queue.perform_async(|| Ok(()), reporter(&tx, "a")).unwrap();
        queue
            .cancel_all_before(|| Ok(()), reporter(&tx, "first"))
            .unwrap();
        queue.perform_async(|| Ok(()), reporter(&tx, "b")).unwrap();
        queue
            .cancel_all_before(|| Ok(()), reporter(&tx, "second"))
            .unwrap();
        queue.perform_async(|| Ok(()), reporter(&tx, "later")).unwrap();
        release.send(()).unwrap();

        let results: Vec<_> = (0..5).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(
            results,
            vec![
                ("a", ActionStatus::Cancelled),
                ("first", ActionStatus::Cancelled),
                ("b", ActionStatus::Cancelled),
                ("second", ActionStatus::Completed),
                ("later", ActionStatus::Completed),
            ]
        );
    }

    #[test]
    fn test_stop_cancels_pending_actions() {
        let queue = Arc::new(ActionQueue::start("stop").unwrap());
        let (tx, rx) = std_mpsc::channel();
        let release = block_worker(&queue);

        queue.perform_async(|| Ok(()), reporter(&tx, "queued")).unwrap();

        let stopper = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.stop())
        };
        // Let stop() raise the flag before the worker is released
        while !queue.flags.will_stop.load(Ordering::Acquire) {
            thread::yield_now();
        }
        release.send(()).unwrap();
        stopper.join().unwrap();

        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            ("queued", ActionStatus::Cancelled)
        );

        queue.perform_async(|| Ok(()), reporter(&tx, "late")).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("late", ActionStatus::Cancelled));
    }

    #[test]
    fn test_stop_from_own_action_does_not_deadlock() {
        let queue = Arc::new(ActionQueue::start("self-stop").unwrap());
        let (tx, rx) = std_mpsc::channel();

        let inner = Arc::clone(&queue);
        queue
            .perform_async(
                move || {
                    inner.stop();
                    Ok(())
                },
                reporter(&tx, "stopper"),
            )
            .unwrap();

        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            ("stopper", ActionStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_perform_awaits_status() {
        let queue = ActionQueue::start("perform").unwrap();
        assert_eq!(queue.perform(|| Ok(())).await, ActionStatus::Completed);
        assert_eq!(
            queue
                .perform(|| Err(ActionError::Failed("nope".to_string())))
                .await,
            ActionStatus::Failed(ActionError::Failed("nope".to_string()))
        );
    }

    #[test]
    fn test_drop_joins_worker() {
        let finished = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = std_mpsc::channel();
        {
            let queue = ActionQueue::start("drop").unwrap();
            let finished = Arc::clone(&finished);
            queue
                .perform_async(
                    move || {
                        let _ = started_tx.send(());
                        thread::sleep(Duration::from_millis(20));
                        finished.store(true, Ordering::Release);
                        Ok(())
                    },
                    |_| {},
                )
                .unwrap();
            started_rx.recv_timeout(WAIT).unwrap();
        }
        assert!(finished.load(Ordering::Acquire));
    }
}
