//! Two-segment emulated path: server ↔ relay ↔ client.
//!
//! ```text
//!   h1 (server)           r1 (relay)            h2 (client)
//!   h1-eth0 ──link1── r1-eth0    r1-eth1 ──link2── h2-eth0
//!   10.0.1.10          10.0.1.1  10.0.2.1           10.0.2.10
//! ```
//!
//! Each host is a Linux network namespace managed via `ip netns`; each link
//! is a veth pair. Shaping is applied to both ends of both links so that
//! loss, delay and rate are symmetric.

use std::fmt;
use std::sync::Arc;

use crate::buffer::QueueCapacity;
use crate::config::{CongestionControl, ExperimentConfig};
use crate::error::Result;
use crate::exec::{CommandRunner, HostCommand};
use crate::shaper::{self, LinkSpec};

/// One of the three emulated hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Host {
    Server,
    Relay,
    Client,
}

impl Host {
    pub const ALL: [Host; 3] = [Host::Server, Host::Relay, Host::Client];

    /// Namespace name.
    pub fn name(&self) -> &'static str {
        match self {
            Host::Server => "h1",
            Host::Relay => "r1",
            Host::Client => "h2",
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One end of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub host: Host,
    pub iface: &'static str,
    pub addr: &'static str,
}

pub const SERVER_IFACE: Endpoint = Endpoint {
    host: Host::Server,
    iface: "h1-eth0",
    addr: "10.0.1.10/24",
};
pub const RELAY_SERVER_IFACE: Endpoint = Endpoint {
    host: Host::Relay,
    iface: "r1-eth0",
    addr: "10.0.1.1/24",
};
pub const RELAY_CLIENT_IFACE: Endpoint = Endpoint {
    host: Host::Relay,
    iface: "r1-eth1",
    addr: "10.0.2.1/24",
};
pub const CLIENT_IFACE: Endpoint = Endpoint {
    host: Host::Client,
    iface: "h2-eth0",
    addr: "10.0.2.10/24",
};

pub const SERVER_ADDR: &str = "10.0.1.10";
pub const CLIENT_ADDR: &str = "10.0.2.10";
pub const RELAY_SERVER_GW: &str = "10.0.1.1";
pub const RELAY_CLIENT_GW: &str = "10.0.2.1";

/// RTT and bottleneck bandwidth implied by two link specs.
///
/// RTT = 2 × (delay1 + delay2); bottleneck = min(bw1, bw2).
pub fn path_properties(link1: &LinkSpec, link2: &LinkSpec) -> (f64, f64) {
    let rtt_ms = 2.0 * (link1.delay_ms + link2.delay_ms);
    let bottleneck_mbps = link1.bandwidth_mbps.min(link2.bandwidth_mbps);
    (rtt_ms, bottleneck_mbps)
}

/// Provisions a [`Topology`] from a validated [`ExperimentConfig`].
pub struct TopologyBuilder {
    config: ExperimentConfig,
    runner: Arc<dyn CommandRunner>,
}

impl TopologyBuilder {
    pub fn new(config: ExperimentConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    /// Creates hosts and links, applies shaping and host parameters.
    ///
    /// All parameter validation happens before the first command is issued.
    /// If a later step fails, the partially built topology is torn down.
    pub fn build(self) -> Result<Topology> {
        let cfg = &self.config;
        cfg.link1.validate()?;
        cfg.link2.validate()?;
        let (rtt_ms, bottleneck_mbps) = path_properties(&cfg.link1, &cfg.link2);
        let capacity = QueueCapacity::from_bdp(rtt_ms, bottleneck_mbps, cfg.mtu)?;

        tracing::info!(
            rtt_ms,
            bottleneck_mbps,
            max_queue_bytes = capacity.bytes,
            max_queue_packets = capacity.packets,
            "sizing queues from bandwidth-delay product"
        );

        let mut topo = Topology {
            runner: self.runner,
            link1: cfg.link1,
            link2: cfg.link2,
            rtt_ms,
            bottleneck_mbps,
            capacity,
            created: Vec::new(),
            torn_down: false,
        };

        topo.create_hosts()?;
        topo.create_links()?;
        topo.configure_routing()?;
        topo.apply_shaping()?;
        topo.set_congestion_control(cfg.cc)?;
        topo.set_segmentation_offload(cfg.offload)?;
        Ok(topo)
    }
}

/// A provisioned emulated network. Owns its namespaces; tears them down on
/// [`Topology::teardown`] or, as a last resort, on drop.
pub struct Topology {
    runner: Arc<dyn CommandRunner>,
    link1: LinkSpec,
    link2: LinkSpec,
    rtt_ms: f64,
    bottleneck_mbps: f64,
    capacity: QueueCapacity,
    created: Vec<Host>,
    torn_down: bool,
}

impl Topology {
    pub fn link1(&self) -> &LinkSpec {
        &self.link1
    }

    pub fn link2(&self) -> &LinkSpec {
        &self.link2
    }

    pub fn rtt_ms(&self) -> f64 {
        self.rtt_ms
    }

    pub fn bottleneck_mbps(&self) -> f64 {
        self.bottleneck_mbps
    }

    pub fn capacity(&self) -> &QueueCapacity {
        &self.capacity
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    /// The four shaped interfaces, each paired with its link.
    pub fn shaped_interfaces(&self) -> [(Endpoint, &LinkSpec); 4] {
        [
            (SERVER_IFACE, &self.link1),
            (RELAY_SERVER_IFACE, &self.link1),
            (RELAY_CLIENT_IFACE, &self.link2),
            (CLIENT_IFACE, &self.link2),
        ]
    }

    fn create_hosts(&mut self) -> Result<()> {
        for host in Host::ALL {
            let ns = host.name();
            // cleanup any leftover namespace with the same name
            self.runner
                .best_effort(&HostCommand::local("ip").args(["netns", "del", ns]));
            self.runner
                .check(&HostCommand::local("ip").args(["netns", "add", ns]))?;
            self.created.push(host);
            self.runner
                .check(&HostCommand::on(ns, "ip").args(["link", "set", "lo", "up"]))?;
        }
        Ok(())
    }

    fn create_links(&mut self) -> Result<()> {
        for (a, b) in [
            (SERVER_IFACE, RELAY_SERVER_IFACE),
            (CLIENT_IFACE, RELAY_CLIENT_IFACE),
        ] {
            self.runner.check(&HostCommand::local("ip").args([
                "link", "add", a.iface, "type", "veth", "peer", "name", b.iface,
            ]))?;
            for end in [a, b] {
                self.runner.check(&HostCommand::local("ip").args([
                    "link",
                    "set",
                    end.iface,
                    "netns",
                    end.host.name(),
                ]))?;
                let ns = end.host.name();
                self.runner.check(
                    &HostCommand::on(ns, "ip").args(["addr", "add", end.addr, "dev", end.iface]),
                )?;
                self.runner
                    .check(&HostCommand::on(ns, "ip").args(["link", "set", end.iface, "up"]))?;
            }
        }
        Ok(())
    }

    fn configure_routing(&self) -> Result<()> {
        self.runner.check(
            &HostCommand::on(Host::Relay.name(), "sysctl").args(["-w", "net.ipv4.ip_forward=1"]),
        )?;
        for (host, gw) in [(Host::Server, RELAY_SERVER_GW), (Host::Client, RELAY_CLIENT_GW)] {
            self.runner.check(
                &HostCommand::on(host.name(), "ip").args(["route", "add", "default", "via", gw]),
            )?;
        }
        Ok(())
    }

    fn apply_shaping(&self) -> Result<()> {
        for (end, link) in self.shaped_interfaces() {
            for step in shaper::shaping_plan(end.host.name(), end.iface, link, &self.capacity) {
                self.runner.check(&step.command)?;
            }
        }
        Ok(())
    }

    /// Sets the TCP congestion control algorithm on every host and turns
    /// off the per-destination metrics cache so trials start cold.
    pub fn set_congestion_control(&self, cc: CongestionControl) -> Result<()> {
        tracing::info!(%cc, "setting congestion control");
        let cc_arg = format!("net.ipv4.tcp_congestion_control={}", cc.as_str());
        for host in Host::ALL {
            let ns = host.name();
            self.runner
                .check(&HostCommand::on(ns, "sysctl").args(["-w", cc_arg.as_str()]))?;
            self.runner.check(
                &HostCommand::on(ns, "sysctl").args(["-w", "net.ipv4.tcp_no_metrics_save=1"]),
            )?;
        }
        Ok(())
    }

    /// Toggles TSO/GSO on all four interfaces. Off means on-wire packets are
    /// MTU-sized.
    pub fn set_segmentation_offload(&self, on: bool) -> Result<()> {
        let state = if on { "on" } else { "off" };
        tracing::info!("tso and gso are {}", state.to_uppercase());
        for (end, _) in self.shaped_interfaces() {
            self.runner.check(
                &HostCommand::on(end.host.name(), "ethtool")
                    .args(["-K", end.iface, "gso", state, "tso", state]),
            )?;
        }
        Ok(())
    }

    /// Removes shaping and deletes every namespace this topology created.
    ///
    /// Callers must stop supervised processes first. Idempotent.
    pub fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        if self.created.len() == Host::ALL.len() {
            for (end, _) in self.shaped_interfaces() {
                self.runner
                    .best_effort(&shaper::clear_command(end.host.name(), end.iface));
            }
        }
        // Deleting a namespace destroys its veth ends, and with them the peers.
        let mut first_err = None;
        for host in self.created.drain(..).rev() {
            let cmd = HostCommand::local("ip").args(["netns", "del", host.name()]);
            if let Err(e) = self.runner.check(&cmd) {
                tracing::warn!(host = %host, error = %e, "failed to delete namespace");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Topology {
    fn drop(&mut self) {
        if !self.torn_down {
            tracing::warn!("topology dropped without teardown, cleaning up");
            let _ = self.teardown();
        }
    }
}
