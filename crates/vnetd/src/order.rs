//! Display order for interfaces.
//!
//! Port-family interfaces (front-panel ports, their subports and the vlans
//! stacked on them) list first, highest port index first, and within one
//! port by ascending subport then vlan. Everything else (bridges, lags,
//! loopbacks) follows in name order.

use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;

/// `xeth<port>[-<subport>][.<vlan>]`
static PORT_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^xeth(\d+)(?:-(\d+))?(?:\.(\d+))?$").expect("Invalid regex pattern")
});

/// Interface family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IfKind {
    Port,
    Subport,
    Vlan,
    Other,
}

impl IfKind {
    pub fn is_port_family(self) -> bool {
        !matches!(self, IfKind::Other)
    }
}

/// Hierarchical interface identifier used for ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IfIdentifier {
    pub kind: IfKind,
    /// Port index.
    pub primary: u16,
    /// Subport index within the port.
    pub secondary: u16,
    /// Vlan id for vlan interfaces, 0 otherwise.
    pub vlan: u16,
    pub name: String,
}

impl IfIdentifier {
    pub fn port(primary: u16, secondary: u16, name: impl Into<String>) -> Self {
        let kind = if secondary == 0 {
            IfKind::Port
        } else {
            IfKind::Subport
        };
        Self {
            kind,
            primary,
            secondary,
            vlan: 0,
            name: name.into(),
        }
    }

    pub fn other(name: impl Into<String>) -> Self {
        Self {
            kind: IfKind::Other,
            primary: 0,
            secondary: 0,
            vlan: 0,
            name: name.into(),
        }
    }

    /// Derives the identifier from an interface name.
    ///
    /// Names that do not follow the `xeth<port>[-<subport>][.<vlan>]`
    /// convention are classified as [`IfKind::Other`]. A subport suffix is
    /// 1-based in the name and stored 0-based.
    pub fn parse(name: &str) -> Self {
        let Some(caps) = PORT_NAME_RE.captures(name) else {
            return Self::other(name);
        };
        let index = |i: usize| -> Option<u16> { caps.get(i).and_then(|m| m.as_str().parse().ok()) };
        let Some(primary) = index(1) else {
            return Self::other(name);
        };
        let secondary = index(2).map(|s| s.saturating_sub(1)).unwrap_or(0);
        match index(3) {
            Some(vlan) => Self {
                kind: IfKind::Vlan,
                primary,
                secondary,
                vlan,
                name: name.to_string(),
            },
            None => Self::port(primary, secondary, name),
        }
    }
}

/// Total order over interface identifiers.
pub fn compare(a: &IfIdentifier, b: &IfIdentifier) -> Ordering {
    match (a.kind.is_port_family(), b.kind.is_port_family()) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (true, true) => b
            .primary
            .cmp(&a.primary)
            .then(a.secondary.cmp(&b.secondary))
            .then(a.vlan.cmp(&b.vlan))
            .then_with(|| a.name.cmp(&b.name)),
        (false, false) => a.name.cmp(&b.name),
    }
}

impl Ord for IfIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(self, other)
    }
}

impl PartialOrd for IfIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
