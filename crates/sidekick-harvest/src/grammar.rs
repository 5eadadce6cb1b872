//! Named line grammars of benchmark logs.
//!
//! Every rule for recognising a line lives here so that the parser state
//! machine only decides what to do with an already-classified line.
//!
//! Timed-metric family:
//!
//! ```text
//! Link1 delay=25ms loss=0.25 bw=10        condition marker (loss)
//! Data Size: 1000k                         condition marker (data size)
//! ... time_total ... exitcode ...          header: declares the columns
//! ... 1.532 ... 0 ...                      data line
//! <blank> | *** | /tmp | No such | ...     terminator
//! ```
//!
//! Condition-window-sample family:
//!
//! ```text
//! cwnd 14520 Instant { tv_sec: 5077, tv_nsec: 393459541 } (on_packet_acked)
//! ```

use serde::Serialize;

/// Substrings that end a block of data lines.
pub const DEFAULT_SENTINELS: [&str; 6] = ["***", "/tmp", "No such", "factor", "unaccounted", "sudo"];

/// Token marking a line as diagnostic output of the sidekick receiver.
pub const DIAGNOSTIC_TOKEN: &str = "[sidekick]";

/// Token naming the exit-code column in a header line.
pub const EXIT_CODE_TOKEN: &str = "exitcode";

/// Default metric column of the timed-metric family.
pub const DEFAULT_METRIC: &str = "time_total";

/// Which marker line sets the varying coordinate of the condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// `Link<link> ... loss=<percent> ...`
    Loss { link: u8 },
    /// `Data Size: <n>k`
    DataSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Loss in hundredths of a percent.
    Loss(u32),
    DataSizeKb(u64),
}

/// Column layout declared by a header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Header {
    pub metric_col: usize,
    pub exit_col: Option<usize>,
}

impl Header {
    /// Number of columns a data line needs to be read under this header.
    pub fn min_width(&self) -> usize {
        self.metric_col.max(self.exit_col.unwrap_or(0)) + 1
    }
}

/// A classified log line.
#[derive(Debug, Clone, PartialEq)]
pub enum Line<'a> {
    Marker(Marker),
    /// Looks like the selected marker but its value does not parse.
    BadMarker,
    Header(Header),
    Terminator,
    /// Diagnostic output interleaved with data lines.
    Diagnostic,
    /// A marker of a kind this grammar does not track.
    Ignored,
    Data(Vec<&'a str>),
}

#[derive(Debug, Clone)]
pub struct Grammar {
    pub metric: String,
    pub marker: MarkerKind,
    pub sentinels: Vec<String>,
    pub diagnostic: String,
}

impl Grammar {
    pub fn new(metric: &str, marker: MarkerKind) -> Self {
        Self {
            metric: metric.to_string(),
            marker,
            sentinels: DEFAULT_SENTINELS.iter().map(|s| s.to_string()).collect(),
            diagnostic: DIAGNOSTIC_TOKEN.to_string(),
        }
    }

    pub fn classify<'a>(&self, line: &'a str) -> Line<'a> {
        let line = line.trim();
        let tokens: Vec<&str> = line.split_whitespace().collect();

        // Receiver chatter may mention paths or sentinels; it never ends a block.
        if tokens.iter().any(|t| *t == self.diagnostic) {
            return Line::Diagnostic;
        }
        if let Some(marker) = self.match_marker(line) {
            return marker;
        }
        if let Some(header) = self.match_header(line) {
            return Line::Header(header);
        }
        if self.is_terminator(line) {
            return Line::Terminator;
        }
        Line::Data(tokens)
    }

    fn match_marker(&self, line: &str) -> Option<Line<'static>> {
        let loss_link = link_marker(line);
        let data_size = line.contains("Data Size");
        match self.marker {
            MarkerKind::Loss { link } => match loss_link {
                Some((n, value)) if n == link => Some(
                    parse_loss(value)
                        .map(|l| Line::Marker(Marker::Loss(l)))
                        .unwrap_or(Line::BadMarker),
                ),
                Some(_) => Some(Line::Ignored),
                None if data_size => Some(Line::Ignored),
                None => None,
            },
            MarkerKind::DataSize => {
                if data_size {
                    Some(
                        parse_data_size(line)
                            .map(|kb| Line::Marker(Marker::DataSizeKb(kb)))
                            .unwrap_or(Line::BadMarker),
                    )
                } else if loss_link.is_some() {
                    Some(Line::Ignored)
                } else {
                    None
                }
            }
        }
    }

    fn match_header(&self, line: &str) -> Option<Header> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let metric_col = tokens.iter().position(|t| *t == self.metric)?;
        let exit_col = tokens.iter().position(|t| *t == EXIT_CODE_TOKEN);
        Some(Header {
            metric_col,
            exit_col,
        })
    }

    fn is_terminator(&self, line: &str) -> bool {
        line.is_empty() || self.sentinels.iter().any(|s| line.contains(s.as_str()))
    }
}

/// `Link<n> ... loss=<value> ...` → `(n, value)`.
fn link_marker(line: &str) -> Option<(u8, &str)> {
    let at = line.find("Link")?;
    let rest = &line[at + 4..];
    let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let link: u8 = rest[..digits].parse().ok()?;
    let loss_at = rest.find("loss=")?;
    let value = rest[loss_at + 5..].split_whitespace().next().unwrap_or("");
    Some((link, value))
}

/// Percent string → hundredths of a percent, rounded.
fn parse_loss(value: &str) -> Option<u32> {
    let pct: f64 = value.trim_end_matches('%').parse().ok()?;
    if !pct.is_finite() || pct < 0.0 {
        return None;
    }
    Some((pct * 100.0).round() as u32)
}

fn parse_data_size(line: &str) -> Option<u64> {
    let at = line.find("Data Size")?;
    let value = line[at + "Data Size".len()..]
        .trim_start_matches(':')
        .trim();
    value.strip_suffix('k').unwrap_or(value).parse().ok()
}

/// One condition-window-sample line.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowLine {
    pub metric: String,
    pub value: u64,
    /// `tv_sec + tv_nsec / 1e9`.
    pub timestamp: f64,
    pub reason: String,
}

/// Parses `<metric> <value> Instant { tv_sec: <s>, tv_nsec: <ns> } (<reason>)`.
pub fn parse_window_line(line: &str) -> Option<WindowLine> {
    let line = line.trim();
    let (metric, rest) = line.split_once(' ')?;
    let (value, rest) = rest.split_once(' ')?;
    let rest = rest.strip_prefix("Instant { tv_sec: ")?;
    let (secs, rest) = rest.split_once(", tv_nsec: ")?;
    let (nanos, rest) = rest.split_once(" } (")?;
    let reason = &rest[..rest.rfind(')')?];

    let secs: u64 = secs.parse().ok()?;
    let nanos: u64 = nanos.parse().ok()?;
    Some(WindowLine {
        metric: metric.to_string(),
        value: value.parse().ok()?,
        timestamp: secs as f64 + nanos as f64 / 1_000_000_000.0,
        reason: reason.to_string(),
    })
}

/// The segment count from an `ss -i` line containing `cwnd:<n>`.
pub fn parse_ss_cwnd(line: &str) -> Option<u64> {
    let at = line.find("cwnd:")?;
    let rest = &line[at + 5..];
    let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    rest[..digits].parse().ok()
}

/// `(interval start, KBytes)` from an iperf interval report ending in `KBytes`.
pub fn parse_iperf_cwnd(line: &str) -> Option<(f64, f64)> {
    let body = line.trim().strip_suffix(" KBytes")?;
    let kbytes: f64 = body.split_whitespace().last()?.parse().ok()?;
    let after = &body[body.rfind(']')? + 1..];
    if !after.starts_with(char::is_whitespace) {
        return None;
    }
    let start: f64 = after.trim_start().split('-').next()?.parse().ok()?;
    Some((start, kbytes))
}
