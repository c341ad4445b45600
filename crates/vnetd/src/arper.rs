//! Unresolved neighbour prober.
//!
//! The kernel only resolves a neighbour when traffic is sent to it. This
//! task pings every neighbour the platform reports as unresolved, inside
//! the neighbour's network namespace, so the entry gets resolved before
//! the first real packet needs it.

use crate::scheduler::{Context, Task};
use crate::vnet::Vnet;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, trace, warn};

/// Path to the `ip` command.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `ping` command.
pub const PING_CMD: &str = "/bin/ping";

const DEFAULT_NETNS: &str = "default";

/// Argument vector pinging `addr` once, inside `netns` unless it is the
/// default namespace.
pub fn ping_command(netns: &str, addr: &str) -> Vec<String> {
    let mut argv = Vec::new();
    if netns != DEFAULT_NETNS {
        argv.extend([IP_CMD, "netns", "exec", netns].map(String::from));
    }
    argv.extend([PING_CMD, "-q", "-c", "1", "-W", "1", addr].map(String::from));
    argv
}

/// Periodic prober task.
#[derive(Debug, Default)]
pub struct UnresolvedArper {
    probes: u64,
}

impl UnresolvedArper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pings spawned so far.
    pub fn probes(&self) -> u64 {
        self.probes
    }

    /// Spawns one ping per unresolved neighbour; returns the commands.
    pub fn tick(&mut self, vnet: &Vnet) -> Vec<Vec<String>> {
        let commands: Vec<Vec<String>> = vnet
            .platform
            .unresolved_neighbors()
            .iter()
            .map(|n| ping_command(&n.netns, &n.addr.to_string()))
            .collect();
        let Some(runtime) = vnet.runtime.as_ref() else {
            if !commands.is_empty() {
                debug!(count = commands.len(), "no runtime, probes skipped");
            }
            return commands;
        };
        for argv in &commands {
            let argv = argv.clone();
            runtime.spawn(async move {
                let Some((program, args)) = argv.split_first() else {
                    return;
                };
                trace!(command = %argv.join(" "), "probing neighbour");
                let status = Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                if let Err(e) = status {
                    warn!(command = %argv.join(" "), error = %e, "probe failed to start");
                }
            });
            self.probes += 1;
        }
        commands
    }
}

impl Task<Vnet> for UnresolvedArper {
    fn name(&self) -> &str {
        "unresolved-arper"
    }

    fn run(&mut self, cx: &mut Context<'_, Vnet>) {
        let interval = cx.state().intervals().unresolved_arp();
        cx.reschedule_after(interval);
        self.tick(cx.state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SimulatedPlatform;
    use crate::vnet::tests::test_vnet;
    use pretty_assertions::assert_eq;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_ping_command_default_namespace() {
        assert_eq!(
            ping_command("default", "10.0.0.1"),
            vec!["/bin/ping", "-q", "-c", "1", "-W", "1", "10.0.0.1"]
        );
    }

    #[test]
    fn test_ping_command_named_namespace() {
        assert_eq!(
            ping_command("blue", "fe80::1"),
            vec![
                "/sbin/ip", "netns", "exec", "blue", "/bin/ping", "-q", "-c", "1", "-W", "1",
                "fe80::1"
            ]
        );
    }

    #[test]
    fn test_tick_builds_one_probe_per_neighbour() {
        let mut sim = SimulatedPlatform::new(1, 1);
        sim.add_unresolved_neighbor("default", IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7)));
        sim.add_unresolved_neighbor("red", IpAddr::V6(Ipv6Addr::LOCALHOST));
        let (vnet, _, _) = test_vnet(sim);

        let mut arper = UnresolvedArper::new();
        let commands = arper.tick(&vnet);
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].last().map(String::as_str), Some("192.168.1.7"));
        assert_eq!(commands[1][..4], ["/sbin/ip", "netns", "exec", "red"]);
        // no runtime attached
        assert_eq!(arper.probes(), 0);
    }
}
