//! Per-interface packet/byte counters across a measurement window.
//!
//! Counters are read from `/sys/class/net/<iface>/statistics/<name>` inside
//! the owning namespace. A snapshot taken before the first trial and one
//! taken after the last bracket the window; their difference attributes
//! traffic to each hop independently of what the benchmark reports.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{Result, SimError};
use crate::exec::{CommandRunner, HostCommand};
use crate::topology::{
    Endpoint, CLIENT_IFACE, RELAY_CLIENT_IFACE, RELAY_SERVER_IFACE, SERVER_IFACE,
};

/// Counter file names, in column order.
pub const COUNTER_NAMES: [&str; 4] = ["tx_packets", "tx_bytes", "rx_packets", "rx_bytes"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct InterfaceCounters {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}

/// Difference of two [`InterfaceCounters`] samples of the same interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CounterDelta {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}

impl InterfaceCounters {
    fn set(&mut self, name: &str, value: u64) {
        match name {
            "tx_packets" => self.tx_packets = value,
            "tx_bytes" => self.tx_bytes = value,
            "rx_packets" => self.rx_packets = value,
            "rx_bytes" => self.rx_bytes = value,
            _ => {}
        }
    }

    /// `later - self`, field by field. A counter that went backwards means
    /// the interface was reset or wrapped, and the window is unusable.
    pub fn delta_to(&self, later: &InterfaceCounters, iface: &str) -> Result<CounterDelta> {
        let sub = |name: &str, before: u64, after: u64| {
            after.checked_sub(before).ok_or_else(|| {
                SimError::Counter(format!(
                    "{iface} {name} decreased from {before} to {after}"
                ))
            })
        };
        Ok(CounterDelta {
            tx_packets: sub("tx_packets", self.tx_packets, later.tx_packets)?,
            tx_bytes: sub("tx_bytes", self.tx_bytes, later.tx_bytes)?,
            rx_packets: sub("rx_packets", self.rx_packets, later.rx_packets)?,
            rx_bytes: sub("rx_bytes", self.rx_bytes, later.rx_bytes)?,
        })
    }
}

/// The four measured hops along the download path, client first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Hop {
    ClientEgress,
    RelayIngressNear,
    RelayEgressFar,
    ServerIngress,
}

impl Hop {
    pub const ALL: [Hop; 4] = [
        Hop::ClientEgress,
        Hop::RelayIngressNear,
        Hop::RelayEgressFar,
        Hop::ServerIngress,
    ];

    pub fn endpoint(&self) -> Endpoint {
        match self {
            Hop::ClientEgress => CLIENT_IFACE,
            Hop::RelayIngressNear => RELAY_CLIENT_IFACE,
            Hop::RelayEgressFar => RELAY_SERVER_IFACE,
            Hop::ServerIngress => SERVER_IFACE,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Hop::ClientEgress => "client-egress",
            Hop::RelayIngressNear => "relay-ingress-near",
            Hop::RelayEgressFar => "relay-egress-far",
            Hop::ServerIngress => "server-ingress",
        }
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Counters of every watched interface at one instant, keyed by interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub counters: BTreeMap<String, InterfaceCounters>,
}

/// Reads counters for a fixed set of interfaces.
pub struct InterfaceStatsCollector {
    runner: Arc<dyn CommandRunner>,
    endpoints: Vec<Endpoint>,
}

impl InterfaceStatsCollector {
    pub fn new(runner: Arc<dyn CommandRunner>, endpoints: Vec<Endpoint>) -> Self {
        Self { runner, endpoints }
    }

    /// Watches the four hops of the emulated path.
    pub fn for_path(runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(runner, Hop::ALL.iter().map(Hop::endpoint).collect())
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        let mut snap = Snapshot::default();
        for end in &self.endpoints {
            let mut counters = InterfaceCounters::default();
            for name in COUNTER_NAMES {
                counters.set(name, self.read(end, name)?);
            }
            snap.counters.insert(end.iface.to_string(), counters);
        }
        Ok(snap)
    }

    fn read(&self, end: &Endpoint, name: &str) -> Result<u64> {
        let path = format!("/sys/class/net/{}/statistics/{}", end.iface, name);
        let cmd = HostCommand::on(end.host.name(), "cat").arg(path.as_str());
        let out = self
            .runner
            .run(&cmd)
            .map_err(|e| SimError::Counter(format!("{cmd}: {e}")))?;
        if !out.success() {
            return Err(SimError::Counter(format!(
                "{cmd}: {}",
                out.stderr.trim()
            )));
        }
        out.stdout
            .trim()
            .parse()
            .map_err(|_| SimError::Counter(format!("{path}: not a counter: {:?}", out.stdout)))
    }
}

/// Per-interface difference between two snapshots of the same interfaces.
pub fn delta(before: &Snapshot, after: &Snapshot) -> Result<BTreeMap<String, CounterDelta>> {
    if !before.counters.keys().eq(after.counters.keys()) {
        return Err(SimError::Counter(format!(
            "snapshots cover different interfaces: {:?} vs {:?}",
            before.counters.keys().collect::<Vec<_>>(),
            after.counters.keys().collect::<Vec<_>>()
        )));
    }
    before
        .counters
        .iter()
        .map(|(iface, b)| {
            let a = &after.counters[iface];
            Ok((iface.clone(), b.delta_to(a, iface)?))
        })
        .collect()
}

/// Aligned table of the hop deltas, header first.
pub fn render_hop_table(deltas: &BTreeMap<String, CounterDelta>) -> Vec<String> {
    let mut lines = vec![format!(
        "{:<20}{:>12}{:>12}{:>12}{:>12}",
        "", "tx_packets", "tx_bytes", "rx_packets", "rx_bytes"
    )];
    for hop in Hop::ALL {
        if let Some(d) = deltas.get(hop.endpoint().iface) {
            lines.push(format!(
                "{:<20}{:>12}{:>12}{:>12}{:>12}",
                hop.label(),
                d.tx_packets,
                d.tx_bytes,
                d.rx_packets,
                d.rx_bytes
            ));
        }
    }
    lines
}
