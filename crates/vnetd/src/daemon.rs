//! Daemon lifecycle.
//!
//! [`Daemon::start`] wires one [`Vnet`] context into a scheduler thread,
//! starts both queue forwarders, the optional message dispatcher and the
//! control server. [`Daemon::shutdown`] stops the scheduler first so no
//! more records are produced, then closes both queues and waits for the
//! forwarders to drain them.

use crate::arper::UnresolvedArper;
use crate::config::VnetdConfig;
use crate::control::{self, ControlState};
use crate::dispatch::run_dispatcher;
use crate::error::{Result, VnetdError};
use crate::event::Event;
use crate::metrics::MetricsCollector;
use crate::platform::{Message, Platform};
use crate::poller::{FastPoller, SlowPoller};
use crate::publish::{Forwarder, Publisher};
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::sink::{BrokerSink, LogSink, MemorySink, RedisSink, Sink};
use crate::vnet::Vnet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Where published records go.
#[derive(Debug, Clone)]
pub enum SinkChoice {
    /// Slow records into the configured hash, fast lines published to the
    /// `hf-broker`.
    Redis,
    /// Everything to the log.
    Log,
    /// In-memory collectors, for tests.
    Memory { slow: MemorySink, fast: MemorySink },
}

/// A running daemon.
pub struct Daemon {
    scheduler: SchedulerHandle<Vnet>,
    scheduler_thread: Option<thread::JoinHandle<Vnet>>,
    event: Event,
    metrics: Arc<MetricsCollector>,
    shutdown: CancellationToken,
    forwarders: Vec<JoinHandle<u64>>,
    tasks: Vec<JoinHandle<()>>,
    control_addr: SocketAddr,
}

impl Daemon {
    /// Starts every component. Must be called from within a tokio runtime.
    ///
    /// Without a `messages` stream readiness is announced right after the
    /// startup records; with one, on its first [`Message::Break`].
    pub async fn start(
        config: &VnetdConfig,
        platform: Box<dyn Platform>,
        sinks: SinkChoice,
        messages: Option<mpsc::Receiver<Message>>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(MetricsCollector::new()?);

        let (publisher, rx) = Publisher::channel(config.publish.channel_depth);
        let (hf_publisher, hf_rx) = Publisher::channel(config.publish.hf_channel_depth);
        let vnet = Vnet::new(platform, publisher.clone(), hf_publisher, Arc::clone(&metrics))
            .with_intervals(config.intervals())
            .with_unix_only(config.poll.unix_interfaces_only)
            .with_hostname(config.hostname())
            .with_runtime(Handle::current());

        let (slow_sink, fast_sink): (Box<dyn Sink>, Box<dyn Sink>) = match sinks {
            SinkChoice::Redis => {
                let redis = &config.redis;
                let slow =
                    RedisSink::connect(&redis.host, redis.port, i64::from(redis.db), &redis.hash)
                        .await?;
                let fast = BrokerSink::new(vnet.subscribe_broker(), redis.hf_channel.clone());
                (Box::new(slow), Box::new(fast))
            }
            SinkChoice::Log => (Box::new(LogSink), Box::new(LogSink)),
            SinkChoice::Memory { slow, fast } => (Box::new(slow), Box::new(fast)),
        };

        let listener = control::bind(config.listen_addr()?).await?;
        let control_addr = listener.local_addr()?;

        let mut scheduler = Scheduler::new(vnet);
        scheduler.add_job(|cx| cx.state().publish_init(), Duration::ZERO);
        if messages.is_none() {
            scheduler.add_job(|cx| cx.state().publish_ready(), Duration::ZERO);
        }
        scheduler.add_task(Box::new(SlowPoller::new()), Duration::ZERO);
        scheduler.add_task(Box::new(FastPoller::new()), Duration::ZERO);
        scheduler.add_task(Box::new(UnresolvedArper::new()), Duration::ZERO);
        let (handle, scheduler_thread) = scheduler.spawn()?;

        let event = Event::new(handle.clone(), publisher, Arc::clone(&metrics));
        let shutdown = CancellationToken::new();

        let forwarders = vec![
            tokio::spawn(
                Forwarder::new("slow", config.publish.namespace.clone(), rx, slow_sink)
                    .with_metrics(Arc::clone(&metrics))
                    .run(shutdown.clone()),
            ),
            tokio::spawn(
                Forwarder::new("fast", "", hf_rx, fast_sink)
                    .with_metrics(Arc::clone(&metrics))
                    .run(shutdown.clone()),
            ),
        ];

        let mut tasks = Vec::new();
        if let Some(messages) = messages {
            tasks.push(tokio::spawn(run_dispatcher(
                messages,
                handle.clone(),
                event.clone(),
                shutdown.clone(),
            )));
        }
        let state = ControlState {
            event: event.clone(),
            metrics: Arc::clone(&metrics),
        };
        let control_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = control::serve(listener, state, control_shutdown).await {
                error!(error = %e, "Control server failed");
            }
        }));

        info!(%control_addr, "vnetd started");
        Ok(Self {
            scheduler: handle,
            scheduler_thread: Some(scheduler_thread),
            event,
            metrics,
            shutdown,
            forwarders,
            tasks,
            control_addr,
        })
    }

    /// Settings entry point.
    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn scheduler(&self) -> &SchedulerHandle<Vnet> {
        &self.scheduler
    }

    /// Address the control server is bound to.
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Stops the scheduler, drains both queues and returns the final state.
    pub async fn shutdown(mut self) -> Result<Vnet> {
        info!("vnetd shutting down");
        // an exited scheduler refuses the quit; joining still works
        let _ = self.scheduler.quit();
        let join = self
            .scheduler_thread
            .take()
            .ok_or_else(|| VnetdError::Task("scheduler already joined".to_string()))?;
        let vnet = tokio::task::spawn_blocking(move || join.join())
            .await
            .map_err(|e| VnetdError::Task(e.to_string()))?
            .map_err(|_| VnetdError::Task("scheduler thread panicked".to_string()))?;

        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            task.await.map_err(|e| VnetdError::Task(e.to_string()))?;
        }
        let mut forwarded = 0;
        for forwarder in self.forwarders.drain(..) {
            forwarded += forwarder
                .await
                .map_err(|e| VnetdError::Task(e.to_string()))?;
        }
        info!(forwarded, "vnetd stopped");
        Ok(vnet)
    }
}
