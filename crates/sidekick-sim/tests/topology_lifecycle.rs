//! Ordering contracts of a full topology lifecycle, asserted on the
//! recorded command stream.

use std::sync::Arc;

use sidekick_sim::config::{ExperimentConfig, ExperimentConfigInput};
use sidekick_sim::counters::{self, Hop, InterfaceStatsCollector, COUNTER_NAMES};
use sidekick_sim::shaper::QdiscStrategy;
use sidekick_sim::test_util::RecordingRunner;
use sidekick_sim::topology::TopologyBuilder;
use sidekick_sim::SimError;

fn config(toml: &str) -> ExperimentConfig {
    ExperimentConfigInput::from_toml_str(toml)
        .unwrap()
        .resolve()
        .unwrap()
}

#[test]
fn e2e_path_sizes_queues_from_bdp() {
    let runner = Arc::new(RecordingRunner::default());
    let cfg = config(
        r#"
        [link1]
        delay_ms = 25
        bandwidth_mbps = 10
        [link2]
        delay_ms = 1
        bandwidth_mbps = 100
        "#,
    );
    let mut topo = TopologyBuilder::new(cfg, runner.clone()).build().unwrap();
    assert_eq!(topo.rtt_ms(), 52.0);
    assert_eq!(topo.bottleneck_mbps(), 10.0);
    assert_eq!(topo.capacity().bytes, 65_000.0);

    // Every tbf stage uses the same BDP limit, whichever link it shapes.
    let tbf: Vec<String> = runner
        .lines()
        .into_iter()
        .filter(|l| l.contains(" tbf "))
        .collect();
    assert_eq!(tbf.len(), 4);
    assert!(tbf.iter().all(|l| l.ends_with("limit 65000")));

    topo.teardown().unwrap();
}

#[test]
fn counters_bracket_traffic_and_teardown_comes_last() {
    let runner = Arc::new(RecordingRunner::default());
    let mut topo = TopologyBuilder::new(ExperimentConfig::default(), runner.clone())
        .build()
        .unwrap();
    let collector = InterfaceStatsCollector::for_path(runner.clone());
    let set_all = |value: &str| {
        for hop in Hop::ALL {
            let iface = hop.endpoint().iface;
            for name in COUNTER_NAMES {
                runner.set_output(&format!("cat /sys/class/net/{iface}/statistics/{name}"), value);
            }
        }
    };

    set_all("0\n");
    let before = collector.snapshot().unwrap();
    set_all("42\n");
    let after = collector.snapshot().unwrap();
    let deltas = counters::delta(&before, &after).unwrap();
    assert_eq!(deltas.len(), 4);
    assert!(deltas.values().all(|d| d.tx_bytes == 42 && d.rx_packets == 42));

    topo.teardown().unwrap();
    let lines = runner.lines();
    let last_cat = lines.iter().rposition(|l| l.contains(" cat ")).unwrap();
    let first_clear = lines
        .iter()
        .position(|l| l.contains("tc qdisc del"))
        .unwrap();
    assert!(last_cat < first_clear);
    assert_eq!(lines.last().map(String::as_str), Some("ip netns del h1"));
}

#[test]
fn unsupported_cc_fails_before_mutation() {
    let err = ExperimentConfigInput::from_toml_str("cc = \"bbr\"")
        .unwrap()
        .resolve()
        .unwrap_err();
    assert!(matches!(err, SimError::Config(_)));
}

#[test]
fn none_strategy_leaves_interfaces_unshaped() {
    let runner = Arc::new(RecordingRunner::default());
    let mut cfg = ExperimentConfig::default();
    cfg.link1.qdisc = QdiscStrategy::None;
    cfg.link2.qdisc = QdiscStrategy::None;
    let mut topo = TopologyBuilder::new(cfg, runner.clone()).build().unwrap();
    assert!(!runner.lines().iter().any(|l| l.contains("tc qdisc add")));
    topo.teardown().unwrap();
}
