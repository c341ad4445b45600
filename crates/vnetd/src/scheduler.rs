//! Single-threaded, time-ordered callback runner.
//!
//! The scheduler owns a state value `S` and runs on its own OS thread. It
//! executes exactly one callback at a time: either a registered [`Task`]
//! (a periodic poller that reschedules itself) or a one-shot [`Job`]
//! submitted through a [`SchedulerHandle`] from any thread. Callbacks run
//! in deadline order; equal deadlines run in submission order.
//!
//! Nothing is cancelled mid-flight. A task that wants a different period
//! passes the new delay to its next [`Context::reschedule_after`]; the
//! already queued wakeup is left alone.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// One-shot callback.
pub type Job<S> = Box<dyn FnOnce(&mut Context<'_, S>) + Send>;

/// Periodic callback registered with [`Scheduler::add_task`].
pub trait Task<S>: Send {
    fn name(&self) -> &str;

    /// Runs one tick. Implementations call [`Context::reschedule_after`]
    /// first so their cadence does not drift by the tick's own duration.
    fn run(&mut self, cx: &mut Context<'_, S>);
}

/// Index of a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(usize);

/// Returned when submitting to a scheduler that has exited.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("scheduler has stopped")]
pub struct SchedulerStopped;

/// Deadline `delay` from now. A delay past what [`Instant`] can represent
/// is clamped to [`MAX_DELAY`].
pub fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(MAX_DELAY))
        .unwrap_or(now)
}

/// Upper bound applied by [`deadline_after`] on overflow.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 86_400);

enum Command<S> {
    Run(Job<S>, Instant),
    Quit,
}

enum Entry<S> {
    Task(TaskId),
    Job(Job<S>),
}

struct Timer<S> {
    deadline: Instant,
    seq: u64,
    entry: Entry<S>,
}

impl<S> PartialEq for Timer<S> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<S> Eq for Timer<S> {}

impl<S> Ord for Timer<S> {
    // BinaryHeap is a max-heap; the earliest (deadline, seq) must be greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<S> PartialOrd for Timer<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// What a callback sees while it runs.
pub struct Context<'a, S> {
    state: &'a mut S,
    current: Option<TaskId>,
    pending: Vec<(Entry<S>, Instant)>,
    stop: bool,
}

impl<'a, S> Context<'a, S> {
    pub fn state(&mut self) -> &mut S {
        self.state
    }

    /// Queues the running task's next tick `delay` from now.
    pub fn reschedule_after(&mut self, delay: Duration) {
        match self.current {
            Some(id) => self.pending.push((Entry::Task(id), deadline_after(delay))),
            None => warn!("reschedule_after called outside a task"),
        }
    }

    /// Queues a one-shot job `delay` from now.
    pub fn schedule_after(&mut self, job: Job<S>, delay: Duration) {
        self.pending.push((Entry::Job(job), deadline_after(delay)));
    }

    /// Stops the run loop once the current callback returns.
    pub fn stop(&mut self) {
        self.stop = true;
    }
}

/// Cross-thread submission handle.
pub struct SchedulerHandle<S> {
    tx: mpsc::Sender<Command<S>>,
}

impl<S> Clone for SchedulerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S> std::fmt::Debug for SchedulerHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle").finish_non_exhaustive()
    }
}

impl<S: Send + 'static> SchedulerHandle<S> {
    /// Runs `job` as soon as the scheduler reaches it.
    pub fn signal<F>(&self, job: F) -> Result<(), SchedulerStopped>
    where
        F: FnOnce(&mut Context<'_, S>) + Send + 'static,
    {
        self.signal_after(job, Duration::ZERO)
    }

    pub fn signal_after<F>(&self, job: F, delay: Duration) -> Result<(), SchedulerStopped>
    where
        F: FnOnce(&mut Context<'_, S>) + Send + 'static,
    {
        self.tx
            .send(Command::Run(Box::new(job), deadline_after(delay)))
            .map_err(|_| SchedulerStopped)
    }

    /// Asks the run loop to exit after the current callback.
    pub fn quit(&self) -> Result<(), SchedulerStopped> {
        self.tx.send(Command::Quit).map_err(|_| SchedulerStopped)
    }
}

/// Run loop and its timer queue.
pub struct Scheduler<S> {
    inner: Inner<S>,
    tx: mpsc::Sender<Command<S>>,
    rx: mpsc::Receiver<Command<S>>,
}

impl<S: Send + 'static> Scheduler<S> {
    pub fn new(state: S) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            inner: Inner {
                state,
                tasks: Vec::new(),
                timers: BinaryHeap::new(),
                seq: 0,
            },
            tx,
            rx,
        }
    }

    pub fn handle(&self) -> SchedulerHandle<S> {
        SchedulerHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.inner.state
    }

    /// Registers a periodic task whose first tick runs after `delay`.
    pub fn add_task(&mut self, task: Box<dyn Task<S>>, delay: Duration) -> TaskId {
        let id = TaskId(self.inner.tasks.len());
        debug!(task = task.name(), ?delay, "task registered");
        self.inner.tasks.push(Some(task));
        self.inner.push(Entry::Task(id), deadline_after(delay));
        id
    }

    /// Queues a one-shot job before the loop starts. Jobs and tasks added
    /// with the same delay run in the order they were added.
    pub fn add_job<F>(&mut self, job: F, delay: Duration)
    where
        F: FnOnce(&mut Context<'_, S>) + Send + 'static,
    {
        self.inner.push(Entry::Job(Box::new(job)), deadline_after(delay));
    }

    /// Moves the run loop onto a dedicated thread.
    ///
    /// The thread returns the state when the loop exits.
    pub fn spawn(self) -> std::io::Result<(SchedulerHandle<S>, JoinHandle<S>)> {
        let handle = self.handle();
        let join = thread::Builder::new()
            .name("vnetd-scheduler".to_string())
            .spawn(move || self.run())?;
        Ok((handle, join))
    }

    /// Runs callbacks until quit, a callback calls [`Context::stop`], or
    /// every handle has been dropped.
    pub fn run(self) -> S {
        let Scheduler { mut inner, tx, rx } = self;
        // only external handles keep the loop alive
        drop(tx);
        info!(tasks = inner.tasks.len(), "Scheduler started");

        loop {
            let command = match inner.timers.peek() {
                Some(timer) => {
                    let wait = timer.deadline.saturating_duration_since(Instant::now());
                    rx.recv_timeout(wait)
                }
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            let mut quit = false;
            match command {
                Ok(Command::Run(job, deadline)) => inner.push(Entry::Job(job), deadline),
                Ok(Command::Quit) => quit = true,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("all scheduler handles dropped");
                    break;
                }
            }
            // accept everything already submitted before running due timers
            while !quit {
                match rx.try_recv() {
                    Ok(Command::Run(job, deadline)) => inner.push(Entry::Job(job), deadline),
                    Ok(Command::Quit) => quit = true,
                    Err(_) => break,
                }
            }
            // on quit, jobs submitted ahead of it still run
            if inner.run_due() || quit {
                break;
            }
        }
        info!("Scheduler stopped");
        inner.state
    }
}

struct Inner<S> {
    state: S,
    tasks: Vec<Option<Box<dyn Task<S>>>>,
    timers: BinaryHeap<Timer<S>>,
    seq: u64,
}

impl<S> Inner<S> {
    fn push(&mut self, entry: Entry<S>, deadline: Instant) {
        let seq = self.seq;
        self.seq += 1;
        self.timers.push(Timer {
            deadline,
            seq,
            entry,
        });
    }

    /// Runs every timer that is due. Returns true when a callback asked to
    /// stop.
    fn run_due(&mut self) -> bool {
        loop {
            match self.timers.peek() {
                Some(timer) if timer.deadline <= Instant::now() => {}
                _ => return false,
            }
            let Some(timer) = self.timers.pop() else {
                return false;
            };
            if self.dispatch(timer.entry) {
                return true;
            }
        }
    }

    fn dispatch(&mut self, entry: Entry<S>) -> bool {
        let mut cx = Context {
            state: &mut self.state,
            current: None,
            pending: Vec::new(),
            stop: false,
        };
        match entry {
            Entry::Job(job) => {
                trace!("running job");
                job(&mut cx);
            }
            Entry::Task(id) => {
                let slot = self.tasks.get_mut(id.0).and_then(Option::take);
                match slot {
                    Some(mut task) => {
                        trace!(task = task.name(), "running task");
                        cx.current = Some(id);
                        task.run(&mut cx);
                        self.tasks[id.0] = Some(task);
                    }
                    None => warn!(task = id.0, "task slot empty"),
                }
            }
        }
        let Context { pending, stop, .. } = cx;
        for (entry, deadline) in pending {
            self.push(entry, deadline);
        }
        stop
    }
}
