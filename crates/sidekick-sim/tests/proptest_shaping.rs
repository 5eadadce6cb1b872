//! Property-based tests for queue sizing and shaping plans.

use proptest::prelude::*;
use sidekick_sim::buffer::{QueueCapacity, DEFAULT_MTU};
use sidekick_sim::shaper::{shaping_plan, LinkSpec, QdiscStrategy, Stage};

fn strategy() -> impl Strategy<Value = QdiscStrategy> {
    prop::sample::select(QdiscStrategy::ALL.to_vec())
}

// ─── BDP sizing ─────────────────────────────────────────────────────────────

proptest! {
    /// Byte capacity is RTT(s) × bits/s / 8 with no rounding; the packet
    /// count carries 10% headroom and is never zero.
    #[test]
    fn capacity_matches_bdp(
        rtt_ms in 0.01f64..2_000.0,
        bw_mbps in 0.01f64..10_000.0,
        mtu in 500u32..=9000,
    ) {
        let cap = QueueCapacity::from_bdp(rtt_ms, bw_mbps, mtu).unwrap();
        prop_assert_eq!(cap.bytes, rtt_ms * bw_mbps * 1_000_000.0 / 1000.0 / 8.0);
        prop_assert_eq!(cap.packets, (cap.bytes / mtu as f64 * 1.1).floor() as u64 + 1);
        prop_assert!(cap.packets >= 1);
    }

    #[test]
    fn non_positive_inputs_rejected(rtt_ms in -1_000.0f64..=0.0, bw_mbps in -1_000.0f64..=0.0) {
        prop_assert!(QueueCapacity::from_bdp(rtt_ms, 10.0, DEFAULT_MTU).is_err());
        prop_assert!(QueueCapacity::from_bdp(50.0, bw_mbps, DEFAULT_MTU).is_err());
    }
}

// ─── Shaping order ──────────────────────────────────────────────────────────

proptest! {
    /// For every strategy the netem stage comes first and nothing follows a
    /// queue stage except further queue stages; `none` yields nothing.
    #[test]
    fn impairment_precedes_queue(
        qdisc in strategy(),
        bw in 1.0f64..1_000.0,
        delay in 0.0f64..200.0,
        loss in 0.0f64..10.0,
        rtt in 1.0f64..500.0,
    ) {
        let link = LinkSpec { bandwidth_mbps: bw, delay_ms: delay, loss_percent: loss, qdisc };
        let cap = QueueCapacity::from_bdp(rtt, bw, DEFAULT_MTU).unwrap();
        let plan = shaping_plan("r1", "r1-eth1", &link, &cap);

        if qdisc == QdiscStrategy::None {
            prop_assert!(plan.is_empty());
        } else {
            prop_assert!(!plan.is_empty());
            prop_assert_eq!(plan[0].stage, Stage::Impairment);
            prop_assert!(plan[0].command.args.iter().any(|a| a == "netem"));
            prop_assert!(plan[0].command.args.iter().any(|a| a == "root"));
            let first_queue = plan.iter().position(|s| s.stage == Stage::Queue);
            if let Some(q) = first_queue {
                prop_assert!(plan[q..].iter().all(|s| s.stage == Stage::Queue));
            }
            for step in &plan {
                prop_assert_eq!(step.command.host.as_deref(), Some("r1"));
                prop_assert_eq!(&step.command.program, "tc");
            }
        }
    }
}
