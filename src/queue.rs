//! Serial task queue.
//!
//! A [`SerialTaskQueue`] owns a context value `C` and runs tasks of the form
//! `FnOnce(&mut C)` one at a time on a single dedicated worker thread. Any
//! number of threads may submit work through cloned handles; the worker is
//! the only place the context is ever touched, so the context needs no lock.
//!
//! Tasks can run as soon as possible ([`SerialTaskQueue::dispatch`]) or no
//! earlier than a given delay ([`SerialTaskQueue::dispatch_after`]). Immediate
//! tasks run in submission order, delayed tasks run in deadline order and are
//! interleaved with immediate tasks by readiness.
//!
//! The worker keeps running while at least one strong handle exists or while
//! delayed tasks are still outstanding. Components that live *inside* the
//! context and need to post follow-up work hold a [`WeakTaskQueue`], so they
//! do not keep the worker alive on their own. When the worker finally drains,
//! the context is dropped on the worker thread.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// A unit of work run against the queue's context.
pub type Task<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

enum Message<C> {
    Now(Task<C>),
    At(Instant, Task<C>),
}

/// Handle to a serial worker owning a context of type `C`.
pub struct SerialTaskQueue<C> {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Message<C>>,
}

impl<C> Clone for SerialTaskQueue<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<C> Debug for SerialTaskQueue<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTaskQueue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Non-owning handle to a [`SerialTaskQueue`].
pub struct WeakTaskQueue<C> {
    name: Arc<str>,
    tx: mpsc::WeakUnboundedSender<Message<C>>,
}

impl<C> Clone for WeakTaskQueue<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<C> Debug for WeakTaskQueue<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakTaskQueue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<C> WeakTaskQueue<C> {
    /// Returns a strong handle, or `None` once every strong handle is gone.
    pub fn upgrade(&self) -> Option<SerialTaskQueue<C>> {
        self.tx.upgrade().map(|tx| SerialTaskQueue {
            name: self.name.clone(),
            tx,
        })
    }
}

impl<C: Send + 'static> SerialTaskQueue<C> {
    /// Spawns a worker thread named `name` that owns `context`.
    pub fn new(name: &str, context: C) -> std::io::Result<Self> {
        Self::new_cyclic(name, |_| context)
    }

    /// Spawns a worker whose context is built with a weak handle to the queue
    /// itself, so the context can schedule its own follow-up tasks.
    pub fn new_cyclic(
        name: &str,
        make_context: impl FnOnce(WeakTaskQueue<C>) -> C,
    ) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;

        let (tx, rx) = mpsc::unbounded_channel::<Message<C>>();
        let name: Arc<str> = Arc::from(name);
        let weak = WeakTaskQueue {
            name: name.clone(),
            tx: tx.downgrade(),
        };
        let context = make_context(weak);

        let worker_name = name.clone();
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || runtime.block_on(run_worker(worker_name, rx, context)))?;

        Ok(Self { name, tx })
    }
}

impl<C> SerialTaskQueue<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn downgrade(&self) -> WeakTaskQueue<C> {
        WeakTaskQueue {
            name: self.name.clone(),
            tx: self.tx.downgrade(),
        }
    }

    /// Enqueues `task` to run as soon as possible.
    pub fn dispatch(&self, task: impl FnOnce(&mut C) + Send + 'static) {
        if self.tx.send(Message::Now(Box::new(task))).is_err() {
            log::warn!("{}: worker is gone, dropping task", self.name);
        }
    }

    /// Enqueues `task` to run no earlier than `delay` from now.
    ///
    /// A delay too large to express as a deadline is rejected and the task is dropped.
    pub fn dispatch_after(&self, delay: Duration, task: impl FnOnce(&mut C) + Send + 'static) {
        let Some(deadline) = Instant::now().checked_add(delay) else {
            log::warn!("{}: rejecting task with out of range delay {delay:?}", self.name);
            return;
        };
        if self.tx.send(Message::At(deadline, Box::new(task))).is_err() {
            log::warn!("{}: worker is gone, dropping delayed task", self.name);
        }
    }

    /// Like [`dispatch_after`](Self::dispatch_after) with a delay in seconds.
    ///
    /// Negative, non-finite or out of range delays are rejected and the task is dropped.
    pub fn dispatch_after_secs(&self, seconds: f64, task: impl FnOnce(&mut C) + Send + 'static) {
        match Duration::try_from_secs_f64(seconds) {
            Ok(delay) => self.dispatch_after(delay, task),
            Err(_) => log::warn!("{}: rejecting task with invalid delay {seconds}", self.name),
        }
    }
}

struct Timer<C> {
    deadline: Instant,
    seq: u64,
    task: Task<C>,
}

impl<C> PartialEq for Timer<C> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<C> Eq for Timer<C> {}

impl<C> PartialOrd for Timer<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for Timer<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

async fn run_worker<C>(name: Arc<str>, mut rx: mpsc::UnboundedReceiver<Message<C>>, mut context: C) {
    let mut timers: BinaryHeap<Reverse<Timer<C>>> = BinaryHeap::new();
    let mut seq = 0u64;
    let mut open = true;

    log::debug!("{name}: worker started");

    loop {
        let now = Instant::now();
        while timers.peek().is_some_and(|Reverse(t)| t.deadline <= now) {
            if let Some(Reverse(timer)) = timers.pop() {
                run_task(&name, &mut context, timer.task);
            }
        }

        if !open && timers.is_empty() {
            break;
        }

        let next_deadline = timers.peek().map(|Reverse(t)| t.deadline);
        let sleep = async move {
            match next_deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            msg = rx.recv(), if open => {
                match msg {
                    Some(Message::Now(task)) => run_task(&name, &mut context, task),
                    Some(Message::At(deadline, task)) => {
                        seq += 1;
                        timers.push(Reverse(Timer { deadline, seq, task }));
                    }
                    None => open = false,
                }
            }
            _ = sleep => {}
        }
    }

    log::debug!("{name}: worker drained, shutting down");
    drop(context);
}

fn run_task<C>(name: &str, context: &mut C, task: Task<C>) {
    if catch_unwind(AssertUnwindSafe(|| task(context))).is_err() {
        log::error!("{name}: task panicked, continuing with next task");
    }
}
