//! Property-based tests for the log parser and quartile convention.

use proptest::prelude::*;
use sidekick_harvest::condition::Condition;
use sidekick_harvest::parser::{parse_str, ParserConfig};
use sidekick_harvest::stats::DataPoint;

fn config() -> ParserConfig {
    ParserConfig::loss_sweep(Condition::new("quic", "cubic"), 2, None)
}

fn render(values: &[f64], exits: &[u8]) -> String {
    let mut log = String::from("Link2 delay=1ms loss=0.5 bw=100\nsize_download time_total exitcode\n");
    for (v, e) in values.iter().zip(exits) {
        log.push_str(&format!("10000000 {v} {e}\n"));
    }
    log.push('\n');
    log
}

// ─── Parser round trip ──────────────────────────────────────────────────────

proptest! {
    /// N well-formed lines with zero exit codes yield exactly those N values
    /// in order.
    #[test]
    fn well_formed_lines_round_trip(values in prop::collection::vec(0.001f64..1_000.0, 0..40)) {
        let exits = vec![0u8; values.len()];
        let out = parse_str(&config(), &render(&values, &exits));
        let cond = Condition::new("quic", "cubic").with_loss(50);
        prop_assert_eq!(out.matrix.samples(&cond), values.as_slice());
        prop_assert!(out.anomalies.is_empty());
    }

    /// Lines with a non-zero exit code never contribute a sample.
    #[test]
    fn nonzero_exits_are_dropped(
        rows in prop::collection::vec((0.001f64..1_000.0, prop::sample::select(vec![0u8, 0, 1, 7, 28])), 0..40)
    ) {
        let values: Vec<f64> = rows.iter().map(|r| r.0).collect();
        let exits: Vec<u8> = rows.iter().map(|r| r.1).collect();
        let out = parse_str(&config(), &render(&values, &exits));
        let expected: Vec<f64> = rows.iter().filter(|r| r.1 == 0).map(|r| r.0).collect();
        let cond = Condition::new("quic", "cubic").with_loss(50);
        prop_assert_eq!(out.matrix.samples(&cond), expected.as_slice());
        prop_assert_eq!(out.anomalies.len(), rows.len() - expected.len());
    }

    /// Arbitrary text never panics the parser.
    #[test]
    fn arbitrary_text_is_tolerated(lines in prop::collection::vec(".{0,60}", 0..50)) {
        let _ = parse_str(&config(), &lines.join("\n"));
    }
}

// ─── Quartiles ──────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn quartiles_are_ordered(samples in prop::collection::vec(-1e6f64..1e6, 1..60)) {
        let p = DataPoint::from_samples(&samples).unwrap();
        prop_assert!(p.min <= p.p25);
        prop_assert!(p.p25 <= p.p50);
        prop_assert!(p.p50 <= p.p75);
        prop_assert!(p.p75 <= p.max);
        prop_assert_eq!(p.stdev.is_some(), samples.len() >= 2);
    }
}
