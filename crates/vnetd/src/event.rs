//! Settings mutation protocol.
//!
//! [`Event::apply`] is the only way code outside the scheduler thread
//! changes daemon state. A caller takes a request from a fixed-size
//! [`RequestPool`], submits a zero-delay job to the scheduler and waits on
//! the request's result channel, then on its new-value channel. The echo
//! `"<key>: <new value>"` is published before `apply` returns.
//!
//! Each pooled request carries an explicit state flag. The scheduler side
//! marks it completed after sending both signals; the caller marks it idle
//! once it has drained them. A request is only put back on the free list
//! when it is idle with both channels empty. Anything else (a caller that
//! was cancelled mid-wait, for instance) is discarded and replaced by a
//! fresh request, so two in-flight calls can never share one.

use crate::error::SettingError;
use crate::metrics::MetricsCollector;
use crate::publish::Publisher;
use crate::scheduler::SchedulerHandle;
use crate::vnet::Vnet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

/// Default number of pooled requests.
pub const POOL_SIZE: usize = 64;

const IDLE: u8 = 0;
const IN_FLIGHT: u8 = 1;
const COMPLETED: u8 = 2;

/// Scheduler-facing half of a request.
#[derive(Debug)]
struct Slot {
    id: u64,
    state: AtomicU8,
    result_tx: mpsc::Sender<Result<(), SettingError>>,
    value_tx: mpsc::Sender<String>,
}

/// A pooled request: the slot plus the caller-facing receivers.
#[derive(Debug)]
struct Request {
    slot: Arc<Slot>,
    result_rx: mpsc::Receiver<Result<(), SettingError>>,
    value_rx: mpsc::Receiver<String>,
}

impl Request {
    fn new(id: u64) -> Self {
        let (result_tx, result_rx) = mpsc::channel(1);
        let (value_tx, value_rx) = mpsc::channel(1);
        Self {
            slot: Arc::new(Slot {
                id,
                state: AtomicU8::new(IDLE),
                result_tx,
                value_tx,
            }),
            result_rx,
            value_rx,
        }
    }

    /// Idle with both channels drained.
    fn is_reusable(&mut self) -> bool {
        self.slot.state.load(Ordering::Acquire) == IDLE
            && self.result_rx.try_recv().is_err()
            && self.value_rx.try_recv().is_err()
    }
}

/// Fixed free list of requests.
#[derive(Debug)]
pub struct RequestPool {
    free: Mutex<Vec<Request>>,
    permits: Semaphore,
    next_id: AtomicU64,
    size: usize,
}

impl RequestPool {
    pub fn new(size: usize) -> Arc<Self> {
        let size = size.max(1);
        let next_id = AtomicU64::new(0);
        let free = (0..size)
            .map(|_| Request::new(next_id.fetch_add(1, Ordering::Relaxed)))
            .collect();
        Arc::new(Self {
            free: Mutex::new(free),
            permits: Semaphore::new(size),
            next_id,
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Requests currently on the free list.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Takes a request, waiting while all are in use.
    pub async fn acquire(self: &Arc<Self>) -> Result<Lease, SettingError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SettingError::Unavailable)?;
        permit.forget();
        let request = self.free.lock().pop().unwrap_or_else(|| self.fresh());
        Ok(Lease {
            pool: Arc::clone(self),
            request: Some(request),
        })
    }

    fn fresh(&self) -> Request {
        Request::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn release(&self, mut request: Request) {
        let request = if request.is_reusable() {
            request
        } else {
            warn!(request = request.slot.id, "discarding undrained request");
            self.fresh()
        };
        self.free.lock().push(request);
        self.permits.add_permits(1);
    }
}

/// Exclusive use of one pooled request; returns it to the pool on drop.
#[derive(Debug)]
pub struct Lease {
    pool: Arc<RequestPool>,
    request: Option<Request>,
}

impl Lease {
    /// Identity of the underlying request.
    pub fn id(&self) -> u64 {
        self.request.as_ref().map_or(u64::MAX, |r| r.slot.id)
    }

    /// Marks the request in flight and hands out the scheduler half.
    pub fn begin(&mut self) -> Result<Responder, SettingError> {
        let request = self.request.as_ref().ok_or(SettingError::Unavailable)?;
        request.slot.state.store(IN_FLIGHT, Ordering::Release);
        Ok(Responder {
            slot: Arc::clone(&request.slot),
            answered: false,
        })
    }

    /// Waits for the result and, on success, the new value; then marks the
    /// request idle.
    pub async fn wait(&mut self) -> Result<String, SettingError> {
        let request = self.request.as_mut().ok_or(SettingError::Unavailable)?;
        let result = request
            .result_rx
            .recv()
            .await
            .unwrap_or(Err(SettingError::Unavailable));
        let outcome = match result {
            Ok(()) => request
                .value_rx
                .recv()
                .await
                .ok_or(SettingError::Unavailable),
            Err(e) => Err(e),
        };
        request.slot.state.store(IDLE, Ordering::Release);
        outcome
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(request) = self.request.take() {
            self.pool.release(request);
        }
    }
}

/// Answers one request from the scheduler thread.
///
/// Dropping an unanswered responder (the job never ran) answers
/// [`SettingError::Unavailable`].
#[derive(Debug)]
pub struct Responder {
    slot: Arc<Slot>,
    answered: bool,
}

impl Responder {
    pub fn complete(mut self, outcome: Result<String, SettingError>) {
        self.answer(outcome);
    }

    fn answer(&mut self, outcome: Result<String, SettingError>) {
        self.answered = true;
        // flagged before sending so the caller's idle mark always lands last
        self.slot.state.store(COMPLETED, Ordering::Release);
        let result = match outcome {
            Ok(value) => {
                if self.slot.value_tx.try_send(value).is_err() {
                    warn!(request = self.slot.id, "new value not delivered");
                }
                Ok(())
            }
            Err(e) => Err(e),
        };
        if self.slot.result_tx.try_send(result).is_err() {
            warn!(request = self.slot.id, "result not delivered");
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.answered {
            self.answer(Err(SettingError::Unavailable));
        }
    }
}

/// Cloneable entry point for settings changes.
#[derive(Clone)]
pub struct Event {
    scheduler: SchedulerHandle<Vnet>,
    pool: Arc<RequestPool>,
    publisher: Publisher,
    metrics: Arc<MetricsCollector>,
}

impl Event {
    pub fn new(
        scheduler: SchedulerHandle<Vnet>,
        publisher: Publisher,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self::with_pool(scheduler, publisher, metrics, RequestPool::new(POOL_SIZE))
    }

    pub fn with_pool(
        scheduler: SchedulerHandle<Vnet>,
        publisher: Publisher,
        metrics: Arc<MetricsCollector>,
        pool: Arc<RequestPool>,
    ) -> Self {
        Self {
            scheduler,
            pool,
            publisher,
            metrics,
        }
    }

    pub fn pool(&self) -> &Arc<RequestPool> {
        &self.pool
    }

    /// Applies `key = value` on the scheduler and echoes the new value.
    pub async fn apply(&self, key: &str, value: &str) -> Result<(), SettingError> {
        let mut lease = self.pool.acquire().await?;
        let responder = lease.begin()?;
        let (k, v) = (key.to_string(), value.to_string());
        debug!(key, value, request = lease.id(), "submitting setting");
        // a refused job drops its responder, which answers Unavailable
        let _ = self.scheduler.signal(move |cx| {
            let outcome = cx.state().handle_setting(&k, &v);
            responder.complete(outcome);
        });
        let outcome = lease.wait().await;
        drop(lease);

        match outcome {
            Ok(new_value) => {
                if !self.publisher.publish(format!("{}: {}", key, new_value)).await {
                    warn!(key, "publish queue closed, echo dropped");
                }
                self.metrics.record_setting(true);
                info!(key, value = %new_value, "setting applied");
                Ok(())
            }
            Err(e) => {
                self.metrics.record_setting(false);
                warn!(key, value, error = %e, "setting rejected");
                Err(e)
            }
        }
    }

    /// Announces readiness. One-way: no request, no response.
    pub fn ready(&self) -> Result<(), SettingError> {
        self.scheduler
            .signal(|cx| cx.state().publish_ready())
            .map_err(|_| SettingError::Unavailable)
    }
}
