//! Periodic counter pollers.
//!
//! Both pollers are scheduler tasks that reschedule themselves before doing
//! any work, re-reading their period from [`Vnet`] on every tick so an
//! interval change takes effect from the next wakeup on.
//!
//! The slow poller publishes one `"<if>.<counter>: <value>"` record per
//! changed counter, framed by start/stop diagnostics. The fast poller
//! publishes one comma-joined delta line per interface on the
//! high-frequency queue.

use crate::cache::CounterKey;
use crate::counter;
use crate::platform::{Entity, EntityId, Platform};
use crate::scheduler::{Context, Task};
use crate::vnet::Vnet;
use chrono::{Local, Utc};
use std::collections::HashMap;
use std::fmt::Write;
use tracing::{debug, trace};

/// Month, day and time with milliseconds, e.g. `Mar  4 15:04:05.000`.
pub const STAMP_MILLI: &str = "%b %e %H:%M:%S%.3f";

/// Per-poller bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct PollerState {
    pub sequence: u64,
}

fn sort_by_interface<T>(platform: &dyn Platform, items: &mut [(EntityId, T)]) {
    items.sort_by(|(a, _), (b, _)| match (platform.entity(*a), platform.entity(*b)) {
        (Some(a), Some(b)) => a.ident.cmp(&b.ident),
        _ => a.cmp(b),
    });
}

/// Full/changed counter publisher.
#[derive(Debug, Default)]
pub struct SlowPoller {
    state: PollerState,
}

impl SlowPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &PollerState {
        &self.state
    }

    /// One poll, without rescheduling.
    pub fn tick(&mut self, vnet: &mut Vnet) {
        let _timer = vnet.metrics.start_poll_timer();
        vnet.publish(format!("poll.start.time: {}", Local::now().format(STAMP_MILLI)));
        vnet.publish(format!("poll.start.channel-length: {}", vnet.publisher.len()));

        vnet.publish_interface_config();

        // every counter, zeros included, on the first poll so the sink is
        // fully seeded
        let include_zero = self.state.sequence == 0;
        let mut changed: Vec<(EntityId, (String, u64))> = Vec::new();
        {
            let cache = &mut vnet.cache;
            vnet.platform
                .for_each_counter(include_zero, vnet.unix_only, &mut |id, name, value| {
                    let counter = counter::translate(name);
                    if cache.update(CounterKey::new(id, counter.clone()), value) {
                        changed.push((id, (counter, value)));
                    }
                });
        }
        sort_by_interface(vnet.platform.as_ref(), &mut changed);

        for (id, (counter, value)) in changed {
            let Some(entity) = vnet.platform.entity(id) else {
                continue;
            };
            let is_port = entity.is_port();
            vnet.publish(format!("{}.{}: {}", entity.name, counter, value));
            if value != 0 && is_port {
                vnet.platform.set_stat(id, &counter, value);
            }
        }

        vnet.publish(format!("poll.stop.time: {}", Local::now().format(STAMP_MILLI)));
        let depth = vnet.publisher.len();
        vnet.publish(format!("poll.stop.channel-length: {}", depth));
        vnet.metrics.set_publish_queue_depth(depth);

        vnet.report_speeds();

        vnet.metrics.record_poll_tick("slow");
        self.state.sequence += 1;
    }
}

impl Task<Vnet> for SlowPoller {
    fn name(&self) -> &str {
        "slow-poller"
    }

    fn run(&mut self, cx: &mut Context<'_, Vnet>) {
        let interval = cx.state().intervals().poll();
        cx.reschedule_after(interval);
        self.tick(cx.state());
    }
}

/// High-frequency delta publisher.
#[derive(Debug, Default)]
pub struct FastPoller {
    state: PollerState,
}

impl FastPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &PollerState {
        &self.state
    }

    /// One poll, without rescheduling.
    pub fn tick(&mut self, vnet: &mut Vnet) {
        let mut deltas: HashMap<EntityId, Vec<(String, u64)>> = HashMap::new();
        {
            let cache = &mut vnet.cache;
            vnet.platform
                .for_each_high_freq_counter(true, vnet.unix_only, &mut |id, name, value| {
                    let counter = counter::translate(name);
                    let (delta, _) = cache.update_delta(CounterKey::new(id, counter.clone()), value);
                    deltas.entry(id).or_default().push((counter, delta));
                });
        }
        let mut lines: Vec<(EntityId, Vec<(String, u64)>)> = deltas.into_iter().collect();
        sort_by_interface(vnet.platform.as_ref(), &mut lines);

        let stamp = Utc::now().timestamp_millis();
        let seeding = self.state.sequence == 0;
        for (id, counters) in lines {
            if !seeding && counters.iter().all(|(_, delta)| *delta == 0) {
                continue;
            }
            let Some(entity) = vnet.platform.entity(id) else {
                continue;
            };
            let line = batch_line(&vnet.hostname, stamp, entity, &counters);
            trace!(line = %line, "hf sample");
            if !vnet.hf_publisher.publish_blocking(line) {
                debug!("hf queue closed");
            }
        }

        vnet.metrics.record_poll_tick("fast");
        self.state.sequence += 1;
    }
}

/// `<host>,<epoch_ms>,<if>,<counter>,<delta>,...` with a trailing comma.
pub fn batch_line(host: &str, epoch_ms: i64, entity: &Entity, counters: &[(String, u64)]) -> String {
    let mut line = format!("{},{},{},", host, epoch_ms, entity.name);
    for (counter, delta) in counters {
        let _ = write!(line, "{},{},", counter, delta);
    }
    line
}

impl Task<Vnet> for FastPoller {
    fn name(&self) -> &str {
        "fast-poller"
    }

    fn run(&mut self, cx: &mut Context<'_, Vnet>) {
        let interval = cx.state().intervals().fast_poll();
        cx.reschedule_after(interval);
        self.tick(cx.state());
    }
}
