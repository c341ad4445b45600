//! In-memory switch.
//!
//! Models a front panel of ports (optionally split into subports), one
//! bridge and an internal cpu port without a kernel device. Counters of
//! entities whose link and admin state are both up advance on every
//! enumeration, after the values have been reported.

use super::{
    CounterVisitor, Entity, EntityId, InterfaceConfig, Message, Platform, UnresolvedNeighbor,
};
use crate::error::PlatformError;
use crate::settings::{Bandwidth, Fec};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// Raw counter names and per-read increments for a port at full speed.
const PORT_COUNTERS: [(&str, u64); 7] = [
    ("port rx bytes", 12_500),
    ("port rx packets", 100),
    ("port tx bytes", 6_400),
    ("port tx packets", 50),
    ("port rx crc_error packets", 0),
    ("port tx total collisions", 0),
    ("rx pipe.drops", 0),
];

const HIGH_FREQ_COUNTERS: [&str; 4] = [
    "port rx bytes",
    "port rx packets",
    "port tx bytes",
    "port tx packets",
];

const LOGICAL_COUNTERS: [(&str, u64); 2] = [("rx_packets", 10), ("tx_packets", 10)];

const SUPPORTED_MBPS: [u32; 6] = [1_000, 10_000, 25_000, 40_000, 50_000, 100_000];

const MEDIA: [&str; 3] = ["copper", "fiber", "backplane"];

#[derive(Debug, Clone)]
struct PortState {
    speed: Bandwidth,
    media: String,
    fec: Fec,
    /// Speed used when autonegotiating.
    native_mbps: u32,
}

#[derive(Debug, Clone)]
struct EntityState {
    entity: Entity,
    admin_up: bool,
    link_up: bool,
    port: Option<PortState>,
    counters: Vec<(String, u64, u64)>,
}

impl EntityState {
    fn passing_traffic(&self) -> bool {
        self.admin_up && self.link_up
    }
}

#[derive(Debug, Default)]
struct Written {
    stats: HashMap<(String, String), u64>,
    speeds: HashMap<String, u32>,
}

/// Read-only view of what the daemon wrote back into a
/// [`SimulatedPlatform`], usable after the platform has been moved into the
/// scheduler.
#[derive(Debug, Clone)]
pub struct SimObserver {
    written: Arc<Mutex<Written>>,
}

impl SimObserver {
    /// Value last written back with [`Platform::set_stat`].
    pub fn stat(&self, ifname: &str, counter: &str) -> Option<u64> {
        self.written
            .lock()
            .stats
            .get(&(ifname.to_string(), counter.to_string()))
            .copied()
    }

    /// Speed last passed to [`Platform::report_speed`].
    pub fn reported_speed(&self, ifname: &str) -> Option<u32> {
        self.written.lock().speeds.get(ifname).copied()
    }
}

/// Simulated platform used by the daemon binary and by tests.
#[derive(Debug)]
pub struct SimulatedPlatform {
    entities: Vec<EntityState>,
    by_name: HashMap<String, EntityId>,
    written: Arc<Mutex<Written>>,
    neighbors: Vec<UnresolvedNeighbor>,
}

impl SimulatedPlatform {
    /// Builds `ports` front-panel ports, each split into `subports` when
    /// more than one.
    pub fn new(ports: u16, subports: u16) -> Self {
        let mut sim = Self {
            entities: Vec::new(),
            by_name: HashMap::new(),
            written: Arc::new(Mutex::new(Written::default())),
            neighbors: Vec::new(),
        };
        let subports = subports.max(1);
        let native_mbps = match subports {
            1 => 100_000,
            2 => 50_000,
            _ => 25_000,
        };
        for port in 1..=ports {
            for subport in 1..=subports {
                let name = if subports == 1 {
                    format!("xeth{}", port)
                } else {
                    format!("xeth{}-{}", port, subport)
                };
                sim.add(
                    &name,
                    true,
                    Some(PortState {
                        speed: Bandwidth::Auto,
                        media: "copper".to_string(),
                        fec: Fec::None,
                        native_mbps,
                    }),
                    &PORT_COUNTERS,
                );
            }
        }
        sim.add("xethbr1", true, None, &LOGICAL_COUNTERS);
        sim.add("fe1-cpu", false, None, &LOGICAL_COUNTERS);
        sim
    }

    fn add(&mut self, name: &str, unix: bool, port: Option<PortState>, counters: &[(&str, u64)]) {
        let id = EntityId(self.entities.len() as u32);
        self.by_name.insert(name.to_string(), id);
        self.entities.push(EntityState {
            entity: Entity::new(id, name, unix),
            admin_up: true,
            link_up: false,
            port,
            counters: counters
                .iter()
                .map(|(n, rate)| (n.to_string(), 0, *rate))
                .collect(),
        });
    }

    fn state(&self, id: EntityId) -> Result<&EntityState, PlatformError> {
        self.entities
            .get(id.0 as usize)
            .ok_or_else(|| PlatformError::rejected(id.to_string(), "no such interface"))
    }

    fn port_mut(&mut self, id: EntityId) -> Result<(&str, &mut PortState), PlatformError> {
        let state = self
            .entities
            .get_mut(id.0 as usize)
            .ok_or_else(|| PlatformError::rejected(id.to_string(), "no such interface"))?;
        let name = state.entity.name.as_str();
        match state.port.as_mut() {
            Some(port) => Ok((name, port)),
            None => Err(PlatformError::unsupported(name, "port configuration")),
        }
    }

    /// Messages a freshly started enumeration layer would send: the dump
    /// break followed by link-up for every port.
    pub fn startup_messages(&self) -> Vec<Message> {
        let mut messages = vec![Message::Break];
        messages.extend(
            self.entities
                .iter()
                .filter(|s| s.port.is_some())
                .map(|s| Message::LinkState {
                    ifname: s.entity.name.clone(),
                    up: true,
                }),
        );
        messages
    }

    pub fn add_unresolved_neighbor(&mut self, netns: impl Into<String>, addr: IpAddr) {
        self.neighbors.push(UnresolvedNeighbor {
            netns: netns.into(),
            addr,
        });
    }

    pub fn observer(&self) -> SimObserver {
        SimObserver {
            written: Arc::clone(&self.written),
        }
    }

    fn visit(
        &mut self,
        include_zero: bool,
        unix_only: bool,
        names: Option<&[&str]>,
        f: &mut CounterVisitor<'_>,
    ) {
        for state in &mut self.entities {
            if unix_only && !state.entity.unix {
                continue;
            }
            let advance = state.passing_traffic();
            for (name, value, rate) in &mut state.counters {
                if let Some(names) = names {
                    if !names.contains(&name.as_str()) {
                        continue;
                    }
                }
                if include_zero || *value != 0 {
                    f(state.entity.id, name, *value);
                }
                if advance {
                    *value += *rate;
                }
            }
        }
    }
}

impl Platform for SimulatedPlatform {
    fn for_each_counter(&mut self, include_zero: bool, unix_only: bool, f: &mut CounterVisitor<'_>) {
        self.visit(include_zero, unix_only, None, f);
    }

    fn for_each_high_freq_counter(
        &mut self,
        include_zero: bool,
        unix_only: bool,
        f: &mut CounterVisitor<'_>,
    ) {
        self.visit(include_zero, unix_only, Some(&HIGH_FREQ_COUNTERS[..]), f);
    }

    fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id.0 as usize).map(|s| &s.entity)
    }

    fn entity_by_name(&self, name: &str) -> Option<&Entity> {
        self.by_name.get(name).and_then(|id| self.entity(*id))
    }

    fn interfaces(&self) -> Vec<EntityId> {
        let mut ports: Vec<&Entity> = self
            .entities
            .iter()
            .filter(|s| s.port.is_some())
            .map(|s| &s.entity)
            .collect();
        ports.sort_by(|a, b| a.ident.cmp(&b.ident));
        ports.into_iter().map(|e| e.id).collect()
    }

    fn interface_config(&self, id: EntityId) -> Option<InterfaceConfig> {
        let state = self.entities.get(id.0 as usize)?;
        let port = state.port.as_ref()?;
        let negotiated_mbps = match port.speed {
            Bandwidth::Auto => port.native_mbps,
            speed => speed.mbps(),
        };
        Some(InterfaceConfig {
            speed: port.speed,
            media: port.media.clone(),
            fec: port.fec,
            admin_up: state.admin_up,
            link_up: state.link_up,
            negotiated_mbps,
        })
    }

    fn set_speed(&mut self, id: EntityId, speed: Bandwidth) -> Result<(), PlatformError> {
        let (name, port) = self.port_mut(id)?;
        if speed != Bandwidth::Auto && !SUPPORTED_MBPS.contains(&speed.mbps()) {
            return Err(PlatformError::rejected(name, format!("unsupported speed {}", speed)));
        }
        debug!(ifname = name, %speed, "set speed");
        port.speed = speed;
        Ok(())
    }

    fn set_admin_up(&mut self, id: EntityId, up: bool) -> Result<(), PlatformError> {
        let state = self
            .entities
            .get_mut(id.0 as usize)
            .ok_or_else(|| PlatformError::rejected(id.to_string(), "no such interface"))?;
        debug!(ifname = %state.entity.name, up, "set admin");
        state.admin_up = up;
        Ok(())
    }

    fn set_media(&mut self, id: EntityId, media: &str) -> Result<(), PlatformError> {
        let (name, port) = self.port_mut(id)?;
        if !MEDIA.contains(&media) {
            return Err(PlatformError::rejected(name, format!("unknown media {}", media)));
        }
        port.media = media.to_string();
        Ok(())
    }

    fn set_fec(&mut self, id: EntityId, fec: Fec) -> Result<(), PlatformError> {
        let (name, port) = self.port_mut(id)?;
        let mbps = match port.speed {
            Bandwidth::Auto => port.native_mbps,
            speed => speed.mbps(),
        };
        if fec == Fec::Cl91 && mbps < 25_000 {
            return Err(PlatformError::unsupported(name, "cl91 below 25g"));
        }
        port.fec = fec;
        Ok(())
    }

    fn set_link_up(&mut self, id: EntityId, up: bool) {
        if let Some(state) = self.entities.get_mut(id.0 as usize) {
            state.link_up = up;
        }
    }

    fn set_stat(&mut self, id: EntityId, counter: &str, value: u64) {
        if let Ok(state) = self.state(id) {
            let key = (state.entity.name.clone(), counter.to_string());
            self.written.lock().stats.insert(key, value);
        }
    }

    fn report_speed(&mut self, id: EntityId, mbps: u32) {
        if let Ok(state) = self.state(id) {
            let ifname = state.entity.name.clone();
            self.written.lock().speeds.insert(ifname, mbps);
        }
    }

    fn unresolved_neighbors(&self) -> Vec<UnresolvedNeighbor> {
        self.neighbors.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn collect(sim: &mut SimulatedPlatform, include_zero: bool) -> Vec<(u32, String, u64)> {
        let mut seen = Vec::new();
        sim.for_each_counter(include_zero, true, &mut |id, name, value| {
            seen.push((id.0, name.to_string(), value))
        });
        seen
    }

    #[test]
    fn test_layout() {
        let sim = SimulatedPlatform::new(2, 2);
        let names: Vec<String> = sim
            .interfaces()
            .into_iter()
            .filter_map(|id| sim.entity(id).map(|e| e.name.clone()))
            .collect();
        assert_eq!(names, vec!["xeth2-1", "xeth2-2", "xeth1-1", "xeth1-2"]);
        assert!(sim.entity_by_name("xethbr1").is_some());
        assert!(!sim.entity_by_name("fe1-cpu").unwrap().unix);
    }

    #[test]
    fn test_counters_advance_only_with_link() {
        let mut sim = SimulatedPlatform::new(1, 1);
        assert!(collect(&mut sim, false).is_empty());
        assert_eq!(collect(&mut sim, true).len(), PORT_COUNTERS.len() + LOGICAL_COUNTERS.len());

        let id = sim.entity_by_name("xeth1").unwrap().id;
        sim.set_link_up(id, true);
        // first read reports the old value, then advances
        assert!(collect(&mut sim, false).is_empty());
        let seen = collect(&mut sim, false);
        assert!(seen.contains(&(id.0, "port rx bytes".to_string(), 12_500)));
    }

    #[test]
    fn test_unix_only_filter() {
        let mut sim = SimulatedPlatform::new(1, 1);
        let mut all = 0;
        sim.for_each_counter(true, false, &mut |_, _, _| all += 1);
        let unix = collect(&mut sim, true).len();
        assert_eq!(all, unix + LOGICAL_COUNTERS.len());
    }

    #[test]
    fn test_apply_operations() {
        let mut sim = SimulatedPlatform::new(1, 1);
        let id = sim.entity_by_name("xeth1").unwrap().id;

        sim.set_speed(id, Bandwidth::from_mbps(10_000)).unwrap();
        assert!(sim.set_speed(id, Bandwidth::from_mbps(12_000)).is_err());
        assert!(sim.set_fec(id, Fec::Cl91).is_err());
        sim.set_fec(id, Fec::Cl74).unwrap();
        sim.set_media(id, "fiber").unwrap();
        assert!(sim.set_media(id, "carrier-pigeon").is_err());

        let config = sim.interface_config(id).unwrap();
        assert_eq!(config.speed.to_string(), "10g");
        assert_eq!(config.fec, Fec::Cl74);
        assert_eq!(config.media, "fiber");
        assert_eq!(config.negotiated_mbps, 10_000);

        let bridge = sim.entity_by_name("xethbr1").unwrap().id;
        assert!(sim.interface_config(bridge).is_none());
        assert!(matches!(
            sim.set_speed(bridge, Bandwidth::Auto),
            Err(PlatformError::Unsupported { .. })
        ));
        sim.set_admin_up(bridge, false).unwrap();
    }

    #[test]
    fn test_observer_sees_write_back() {
        let mut sim = SimulatedPlatform::new(1, 1);
        let observer = sim.observer();
        let id = sim.entity_by_name("xeth1").unwrap().id;
        sim.set_stat(id, "rx-bytes", 42);
        sim.report_speed(id, 100_000);
        drop(sim);
        assert_eq!(observer.stat("xeth1", "rx-bytes"), Some(42));
        assert_eq!(observer.stat("xeth1", "tx-bytes"), None);
        assert_eq!(observer.reported_speed("xeth1"), Some(100_000));
    }

    #[test]
    fn test_startup_messages() {
        let sim = SimulatedPlatform::new(2, 1);
        let messages = sim.startup_messages();
        assert_eq!(messages[0], Message::Break);
        assert_eq!(messages.len(), 3);
    }
}
