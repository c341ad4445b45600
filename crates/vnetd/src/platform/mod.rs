//! Hardware-facing collaborator.
//!
//! The daemon never talks to the switch chip or the kernel shim directly;
//! everything it needs (counter enumeration, interface lookup, the apply
//! operations and stat write-back) goes through [`Platform`]. Every method
//! is called from the scheduler thread only.

mod sim;

pub use sim::{SimObserver, SimulatedPlatform};

use crate::error::PlatformError;
use crate::order::{IfIdentifier, IfKind};
use crate::settings::{Bandwidth, Fec};
use std::fmt;
use std::net::IpAddr;

/// Opaque interface handle, stable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An addressable hardware or logical interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub ident: IfIdentifier,
    /// Visible to the kernel as a network device.
    pub unix: bool,
}

impl Entity {
    pub fn new(id: EntityId, name: impl Into<String>, unix: bool) -> Self {
        let name = name.into();
        Self {
            id,
            ident: IfIdentifier::parse(&name),
            name,
            unix,
        }
    }

    /// Front-panel ports and subports, the only entities whose counters are
    /// written back.
    pub fn is_port(&self) -> bool {
        matches!(self.ident.kind, IfKind::Port | IfKind::Subport)
    }
}

/// Snapshot of an interface's configurable attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub speed: Bandwidth,
    pub media: String,
    pub fec: Fec,
    pub admin_up: bool,
    pub link_up: bool,
    /// Speed the link actually runs at; equals `speed` unless autonegotiated.
    pub negotiated_mbps: u32,
}

/// A neighbour entry the kernel has not resolved yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedNeighbor {
    pub netns: String,
    pub addr: IpAddr,
}

/// Notification from the enumeration layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// End of the initial dump; later breaks are no-ops.
    Break,
    LinkState { ifname: String, up: bool },
    AdminState { ifname: String, up: bool },
    EthtoolSpeed { ifname: String, mbps: u32 },
}

/// Callback receiving `(entity, counter name, value)`.
pub type CounterVisitor<'a> = dyn FnMut(EntityId, &str, u64) + 'a;

/// Hardware and enumeration layer.
pub trait Platform: Send {
    /// Visits every regular counter of every entity.
    ///
    /// Zero-valued counters are skipped unless `include_zero` is set;
    /// entities without a kernel device are skipped when `unix_only` is set.
    fn for_each_counter(&mut self, include_zero: bool, unix_only: bool, f: &mut CounterVisitor<'_>);

    /// Visits the high-frequency counter subset.
    fn for_each_high_freq_counter(
        &mut self,
        include_zero: bool,
        unix_only: bool,
        f: &mut CounterVisitor<'_>,
    );

    fn entity(&self, id: EntityId) -> Option<&Entity>;

    fn entity_by_name(&self, name: &str) -> Option<&Entity>;

    /// Hardware interfaces (ports and subports).
    fn interfaces(&self) -> Vec<EntityId>;

    fn interface_config(&self, id: EntityId) -> Option<InterfaceConfig>;

    fn set_speed(&mut self, id: EntityId, speed: Bandwidth) -> Result<(), PlatformError>;

    fn set_admin_up(&mut self, id: EntityId, up: bool) -> Result<(), PlatformError>;

    fn set_media(&mut self, id: EntityId, media: &str) -> Result<(), PlatformError>;

    fn set_fec(&mut self, id: EntityId, fec: Fec) -> Result<(), PlatformError>;

    /// Records a link state change reported by the kernel.
    fn set_link_up(&mut self, id: EntityId, up: bool);

    /// Writes a counter value back into the shared stats registry.
    fn set_stat(&mut self, id: EntityId, counter: &str, value: u64);

    /// Reports the negotiated speed so kernel tools observe it.
    fn report_speed(&mut self, id: EntityId, mbps: u32);

    fn unresolved_neighbors(&self) -> Vec<UnresolvedNeighbor>;
}
