//! Scheduler-owned daemon state.
//!
//! [`Vnet`] holds everything the pollers and setting handlers mutate: the
//! platform, the counter cache, the poll intervals and the producer ends
//! of both publish queues. It lives inside the scheduler and is only ever
//! touched from the scheduler thread.

use crate::cache::CounterCache;
use crate::error::{PlatformError, SettingError};
use crate::metrics::MetricsCollector;
use crate::platform::{EntityId, InterfaceConfig, Message, Platform};
use crate::publish::Publisher;
use crate::settings::{self, format_enable, format_interval, Bandwidth, Setting, MAX_INTERVAL};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Interface names that never get a speed report.
const INTERNAL_NAME_MARKERS: [&str; 3] = ["fe1-", "pg", "meth"];

/// Poll periods, re-read by each poller on every tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intervals {
    /// Slow poll, seconds.
    pub poll: f64,
    /// Fast poll, milliseconds.
    pub fast_poll_ms: f64,
    /// Unresolved neighbour probing, seconds.
    pub unresolved_arp: f64,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            poll: 5.0,
            fast_poll_ms: 200.0,
            unresolved_arp: 1.0,
        }
    }
}

/// Clamps a period in seconds to `[0, MAX_INTERVAL]`; NaN clamps high.
fn period(secs: f64) -> Duration {
    if secs.is_nan() {
        return MAX_INTERVAL;
    }
    Duration::try_from_secs_f64(secs.max(0.0))
        .unwrap_or(MAX_INTERVAL)
        .min(MAX_INTERVAL)
}

impl Intervals {
    pub fn poll(&self) -> Duration {
        period(self.poll)
    }

    pub fn fast_poll(&self) -> Duration {
        period(self.fast_poll_ms / 1000.0)
    }

    pub fn unresolved_arp(&self) -> Duration {
        period(self.unresolved_arp)
    }
}

/// Daemon state owned by the scheduler.
pub struct Vnet {
    pub(crate) platform: Box<dyn Platform>,
    pub(crate) cache: CounterCache,
    pub(crate) publisher: Publisher,
    pub(crate) hf_publisher: Publisher,
    pub(crate) intervals: Intervals,
    pub(crate) unix_only: bool,
    pub(crate) hostname: String,
    pub(crate) metrics: Arc<MetricsCollector>,
    pub(crate) runtime: Option<Handle>,
    hf_broker: watch::Sender<String>,
    published_config: HashMap<String, String>,
}

impl Vnet {
    pub fn new(
        platform: Box<dyn Platform>,
        publisher: Publisher,
        hf_publisher: Publisher,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (hf_broker, _) = watch::channel(String::new());
        Self {
            platform,
            cache: CounterCache::new(),
            publisher,
            hf_publisher,
            intervals: Intervals::default(),
            unix_only: true,
            hostname: "localhost".to_string(),
            metrics,
            runtime: None,
            hf_broker,
            published_config: HashMap::new(),
        }
    }

    pub fn with_intervals(mut self, intervals: Intervals) -> Self {
        self.intervals = intervals;
        self
    }

    pub fn with_unix_only(mut self, unix_only: bool) -> Self {
        self.unix_only = unix_only;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Runtime used to spawn fire-and-forget subprocesses.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn intervals(&self) -> Intervals {
        self.intervals
    }

    pub fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    /// Receiver that observes every `hf-broker` change.
    pub fn subscribe_broker(&self) -> watch::Receiver<String> {
        self.hf_broker.subscribe()
    }

    /// Enqueues a record on the slow-path queue, blocking while it is full.
    pub fn publish(&self, record: impl Into<String>) {
        if !self.publisher.publish_blocking(record) {
            warn!("publish queue closed, record dropped");
        }
    }

    /// Startup records. Runs as the first scheduler job.
    pub fn publish_init(&mut self) {
        self.publish_interface_config();
        self.publish(format!("poll.max-channel-depth: {}", self.publisher.max_depth()));
        self.publish(format!("{}: {}", settings::POLL_INTERVAL, self.intervals.poll));
        self.publish(format!(
            "{}: {}",
            settings::FAST_POLL_INTERVAL,
            self.intervals.fast_poll_ms
        ));
        let broker = self.hf_broker.borrow().clone();
        self.publish(format!("{}: {}", settings::HF_BROKER, broker));
    }

    /// One-way readiness broadcast.
    pub fn publish_ready(&self) {
        self.publish(format!("{}: true", settings::READY));
    }

    /// Publishes speed, media and fec of every hardware interface whose
    /// value differs from what was last published.
    pub fn publish_interface_config(&mut self) {
        for id in self.platform.interfaces() {
            let Some(entity) = self.platform.entity(id) else {
                continue;
            };
            if self.unix_only && !entity.unix {
                continue;
            }
            let Some(config) = self.platform.interface_config(id) else {
                continue;
            };
            let ifname = entity.name.clone();
            let attrs = [
                ("speed", config.speed.to_string()),
                ("media", config.media),
                ("fec", config.fec.to_string()),
            ];
            for (attr, value) in attrs {
                let key = format!("{}.{}", ifname, attr);
                if self.published_config.get(&key) == Some(&value) {
                    continue;
                }
                self.publish(format!("{}: {}", key, value));
                self.published_config.insert(key, value);
            }
        }
    }

    /// Parses and applies one setting; returns the value to echo.
    #[instrument(skip(self))]
    pub fn handle_setting(&mut self, key: &str, value: &str) -> Result<String, SettingError> {
        let setting = Setting::parse(key, value)?;
        self.apply_setting(setting)
    }

    /// Applies a parsed setting and reads back the resulting value.
    pub fn apply_setting(&mut self, setting: Setting) -> Result<String, SettingError> {
        match setting {
            Setting::PollInterval(v) => {
                self.intervals.poll = v;
                Ok(format_interval(v))
            }
            Setting::FastPollInterval(v) => {
                self.intervals.fast_poll_ms = v;
                Ok(format_interval(v))
            }
            Setting::UnresolvedArpInterval(v) => {
                self.intervals.unresolved_arp = v;
                Ok(format_interval(v))
            }
            Setting::HfBroker(addr) => {
                info!(broker = %addr, "hf broker changed");
                self.hf_broker.send_replace(addr.clone());
                Ok(addr)
            }
            Setting::Speed { ifname, speed } => {
                let id = self.entity_id(&ifname)?;
                self.platform.set_speed(id, speed)?;
                Ok(self.read_config(id, &ifname)?.speed.to_string())
            }
            Setting::Admin { ifname, up } => {
                let id = self.entity_id(&ifname)?;
                self.platform.set_admin_up(id, up)?;
                Ok(format_enable(up).to_string())
            }
            Setting::Media { ifname, media } => {
                let id = self.entity_id(&ifname)?;
                self.platform.set_media(id, &media)?;
                Ok(self.read_config(id, &ifname)?.media)
            }
            Setting::Fec { ifname, fec } => {
                let id = self.entity_id(&ifname)?;
                self.platform.set_fec(id, fec)?;
                Ok(self.read_config(id, &ifname)?.fec.to_string())
            }
        }
    }

    fn entity_id(&self, ifname: &str) -> Result<EntityId, SettingError> {
        self.platform
            .entity_by_name(ifname)
            .map(|e| e.id)
            .ok_or_else(|| SettingError::UnknownInterface(ifname.to_string()))
    }

    fn read_config(&self, id: EntityId, ifname: &str) -> Result<InterfaceConfig, SettingError> {
        self.platform
            .interface_config(id)
            .ok_or_else(|| PlatformError::unsupported(ifname, "port configuration").into())
    }

    /// Applies a message that has passed the readiness gate.
    pub fn on_message(&mut self, message: Message) {
        match message {
            Message::Break => {}
            Message::LinkState { ifname, up } => {
                let Some(id) = self.visible_entity(&ifname) else {
                    return;
                };
                self.platform.set_link_up(id, up);
                self.publish(format!("{}.link: {}", ifname, format_enable(up)));
            }
            Message::AdminState { ifname, up } => {
                let Some(id) = self.visible_entity(&ifname) else {
                    return;
                };
                if let Err(e) = self.platform.set_admin_up(id, up) {
                    warn!(ifname = %ifname, error = %e, "admin state not mirrored");
                }
                self.publish(format!("{}.admin: {}", ifname, format_enable(up)));
            }
            Message::EthtoolSpeed { ifname, mbps } => {
                let Some(id) = self.visible_entity(&ifname) else {
                    return;
                };
                if let Err(e) = self.platform.set_speed(id, Bandwidth::from_mbps(mbps)) {
                    warn!(ifname = %ifname, mbps, error = %e, "ethtool speed rejected");
                }
            }
        }
    }

    fn visible_entity(&self, ifname: &str) -> Option<EntityId> {
        match self.platform.entity_by_name(ifname) {
            Some(entity) if !self.unix_only || entity.unix => Some(entity.id),
            Some(_) => None,
            None => {
                debug!(ifname, "message for unknown interface");
                None
            }
        }
    }

    /// Reports the negotiated speed of every link-up hardware interface.
    pub fn report_speeds(&mut self) {
        for id in self.platform.interfaces() {
            let Some(entity) = self.platform.entity(id) else {
                continue;
            };
            if INTERNAL_NAME_MARKERS.iter().any(|m| entity.name.contains(m)) {
                continue;
            }
            match self.platform.interface_config(id) {
                Some(config) if config.link_up => {
                    self.platform.report_speed(id, config.negotiated_mbps);
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::platform::SimulatedPlatform;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    pub(crate) fn test_vnet(
        sim: SimulatedPlatform,
    ) -> (Vnet, mpsc::Receiver<String>, mpsc::Receiver<String>) {
        let (publisher, rx) = Publisher::channel(4096);
        let (hf_publisher, hf_rx) = Publisher::channel(4096);
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let vnet = Vnet::new(Box::new(sim), publisher, hf_publisher, metrics).with_hostname("sw1");
        (vnet, rx, hf_rx)
    }

    pub(crate) fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(record) = rx.try_recv() {
            out.push(record);
        }
        out
    }

    #[test]
    fn test_publish_init() {
        let (mut vnet, mut rx, _) = test_vnet(SimulatedPlatform::new(1, 1));
        vnet.publish_init();
        assert_eq!(
            drain(&mut rx),
            vec![
                "xeth1.speed: auto",
                "xeth1.media: copper",
                "xeth1.fec: none",
                "poll.max-channel-depth: 4096",
                "pollInterval: 5",
                "pollInterval.msec: 200",
                "hf-broker: ",
            ]
        );
    }

    #[test]
    fn test_publish_ready() {
        let (vnet, mut rx, _) = test_vnet(SimulatedPlatform::new(1, 1));
        vnet.publish_ready();
        assert_eq!(drain(&mut rx), vec!["ready: true"]);
    }

    #[test]
    fn test_interface_config_published_on_change_only() {
        let (mut vnet, mut rx, _) = test_vnet(SimulatedPlatform::new(1, 1));
        vnet.publish_interface_config();
        assert_eq!(drain(&mut rx).len(), 3);
        vnet.publish_interface_config();
        assert!(drain(&mut rx).is_empty());

        vnet.handle_setting("xeth1.speed", "40g").unwrap();
        vnet.publish_interface_config();
        assert_eq!(drain(&mut rx), vec!["xeth1.speed: 40g"]);
    }

    #[test]
    fn test_interval_settings() {
        let (mut vnet, _, _) = test_vnet(SimulatedPlatform::new(1, 1));
        assert_eq!(vnet.handle_setting("pollInterval", "10").unwrap(), "10.000000");
        assert_eq!(vnet.intervals().poll(), Duration::from_secs(10));
        assert_eq!(vnet.handle_setting("pollInterval.msec", "50").unwrap(), "50.000000");
        assert_eq!(vnet.intervals().fast_poll(), Duration::from_millis(50));

        assert!(vnet.handle_setting("pollInterval", "0.5").is_err());
        assert!(vnet.handle_setting("pollInterval", "1e300").is_err());
        assert_eq!(vnet.intervals().poll, 10.0);
    }

    #[test]
    fn test_interval_periods_saturate() {
        let intervals = Intervals {
            poll: 1e300,
            fast_poll_ms: f64::NAN,
            unresolved_arp: -3.0,
        };
        assert_eq!(intervals.poll(), MAX_INTERVAL);
        assert_eq!(intervals.fast_poll(), MAX_INTERVAL);
        assert_eq!(intervals.unresolved_arp(), Duration::ZERO);
    }

    #[test]
    fn test_interface_settings_read_back() {
        let (mut vnet, _, _) = test_vnet(SimulatedPlatform::new(1, 1));
        assert_eq!(vnet.handle_setting("xeth1.speed", "25000m").unwrap(), "25g");
        assert_eq!(vnet.handle_setting("xeth1.fec", "rs").unwrap(), "cl91");
        assert_eq!(vnet.handle_setting("xeth1.media", "fiber").unwrap(), "fiber");
        assert_eq!(vnet.handle_setting("xeth1.admin", "off").unwrap(), "false");
        assert_eq!(vnet.handle_setting("xethbr1.admin", "on").unwrap(), "true");
    }

    #[test]
    fn test_setting_errors() {
        let (mut vnet, _, _) = test_vnet(SimulatedPlatform::new(1, 1));
        assert_eq!(
            vnet.handle_setting("xeth9.speed", "10g").unwrap_err(),
            SettingError::UnknownInterface("xeth9".to_string())
        );
        assert!(matches!(
            vnet.handle_setting("xeth1.speed", "12g"),
            Err(SettingError::Platform(_))
        ));
        assert!(matches!(
            vnet.handle_setting("xethbr1.fec", "cl74"),
            Err(SettingError::Platform(_))
        ));
    }

    #[test]
    fn test_hf_broker_notifies_subscribers() {
        let (mut vnet, _, _) = test_vnet(SimulatedPlatform::new(1, 1));
        let mut broker = vnet.subscribe_broker();
        assert_eq!(vnet.handle_setting("hf-broker", "10.0.0.9:6379").unwrap(), "10.0.0.9:6379");
        assert!(broker.has_changed().unwrap());
        assert_eq!(*broker.borrow_and_update(), "10.0.0.9:6379");
    }

    #[test]
    fn test_link_messages() {
        let (mut vnet, mut rx, _) = test_vnet(SimulatedPlatform::new(1, 1));
        vnet.on_message(Message::LinkState {
            ifname: "xeth1".to_string(),
            up: true,
        });
        vnet.on_message(Message::AdminState {
            ifname: "xeth1".to_string(),
            up: false,
        });
        // no kernel device, filtered
        vnet.on_message(Message::LinkState {
            ifname: "fe1-cpu".to_string(),
            up: true,
        });
        vnet.on_message(Message::LinkState {
            ifname: "nope".to_string(),
            up: true,
        });
        assert_eq!(drain(&mut rx), vec!["xeth1.link: true", "xeth1.admin: false"]);
        let id = vnet.platform().entity_by_name("xeth1").unwrap().id;
        assert!(vnet.platform().interface_config(id).unwrap().link_up);
    }

    #[test]
    fn test_ethtool_speed_message() {
        let (mut vnet, _, _) = test_vnet(SimulatedPlatform::new(1, 1));
        vnet.on_message(Message::EthtoolSpeed {
            ifname: "xeth1".to_string(),
            mbps: 50_000,
        });
        let id = vnet.platform().entity_by_name("xeth1").unwrap().id;
        assert_eq!(vnet.platform().interface_config(id).unwrap().speed.to_string(), "50g");
    }
}
