//! Switch Telemetry and Control Daemon
//!
//! Polls hardware and kernel interface counters, publishes changed values
//! and high-frequency deltas to downstream sinks, and applies runtime
//! settings. All state lives in one [`Vnet`] context owned by a
//! single-threaded [`Scheduler`]; everything else reaches it through the
//! [`Event`] mutation protocol or the bounded publish queues.

pub mod arper;
pub mod cache;
pub mod config;
pub mod control;
pub mod counter;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod metrics;
pub mod order;
pub mod platform;
pub mod poller;
pub mod publish;
pub mod scheduler;
pub mod settings;
pub mod sink;
pub mod vnet;

pub use arper::UnresolvedArper;
pub use cache::{CounterCache, CounterKey};
pub use config::VnetdConfig;
pub use daemon::{Daemon, SinkChoice};
pub use dispatch::{GateState, MessageGate};
pub use error::*;
pub use event::{Event, RequestPool};
pub use metrics::MetricsCollector;
pub use order::{IfIdentifier, IfKind};
pub use platform::{
    Entity, EntityId, InterfaceConfig, Message, Platform, SimObserver, SimulatedPlatform,
};
pub use poller::{FastPoller, SlowPoller};
pub use publish::{Forwarder, Publisher};
pub use scheduler::{Scheduler, SchedulerHandle, Task};
pub use settings::{Bandwidth, Fec, Setting};
pub use sink::{BrokerSink, LogSink, MemorySink, RedisSink, Sink};
pub use vnet::{Intervals, Vnet};
