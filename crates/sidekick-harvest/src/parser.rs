//! Streaming log parser for the timed-metric family.
//!
//! A three-state machine fed one line at a time:
//!
//! * `SeekingHeader`: no column layout is known; data lines are skipped.
//! * `Collecting`: data lines under the current header append a sample to
//!   the pending set of the current condition.
//! * `Terminating`: a terminator closed the block. Pending samples are
//!   committed on entry; the next header starts a new block.
//!
//! Marker lines update the current condition in every state. Malformed
//! lines are recorded as [`ParseAnomaly`] values and reset the machine to
//! `SeekingHeader`; they never abort a parse.

use std::fs;
use std::io;
use std::path::Path;

use serde::Serialize;

use crate::condition::{Condition, TrialMatrix};
use crate::grammar::{Grammar, Header, Line, Marker, MarkerKind, DEFAULT_METRIC};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    SeekingHeader,
    Collecting(Header),
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Fewer columns than the header declared.
    ShortLine,
    /// Exit-code column is not an integer.
    BadExitCode,
    /// Metric column is not a number.
    BadMetric,
    /// A marker line with an unreadable value.
    BadMarker,
    /// Non-zero exit code; the sample was discarded.
    NonZeroExit,
}

/// A line the parser could not use.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseAnomaly {
    /// 1-based line number.
    pub line: usize,
    pub kind: AnomalyKind,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParseOutput {
    pub matrix: TrialMatrix,
    pub anomalies: Vec<ParseAnomaly>,
}

/// What a log describes and how to read it.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub grammar: Grammar,
    /// Fixed fields of every condition in the log; markers fill in the rest.
    pub base: Condition,
    /// Samples kept per condition, first come first kept.
    pub max_per_condition: Option<usize>,
}

impl ParserConfig {
    /// Loss sweep over `time_total`, loss taken from link `link`'s marker.
    pub fn loss_sweep(base: Condition, link: u8, max_per_condition: Option<usize>) -> Self {
        Self {
            grammar: Grammar::new(DEFAULT_METRIC, MarkerKind::Loss { link }),
            base,
            max_per_condition,
        }
    }

    /// Data-size sweep over `time_total`.
    pub fn data_size_sweep(base: Condition, max_per_condition: Option<usize>) -> Self {
        Self {
            grammar: Grammar::new(DEFAULT_METRIC, MarkerKind::DataSize),
            base,
            max_per_condition,
        }
    }
}

pub struct LogParser<'c> {
    config: &'c ParserConfig,
    state: ParserState,
    condition: Condition,
    pending: Vec<f64>,
    line_no: usize,
    out: ParseOutput,
}

impl<'c> LogParser<'c> {
    pub fn new(config: &'c ParserConfig) -> Self {
        Self {
            config,
            state: ParserState::SeekingHeader,
            condition: config.base.clone(),
            pending: Vec::new(),
            line_no: 0,
            out: ParseOutput::default(),
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    /// Feeds one line.
    pub fn feed(&mut self, raw: &str) {
        self.line_no += 1;
        match self.config.grammar.classify(raw) {
            Line::Marker(marker) => {
                self.commit();
                match marker {
                    Marker::Loss(loss) => self.condition.loss = Some(loss),
                    Marker::DataSizeKb(kb) => self.condition.data_size_kb = Some(kb),
                }
            }
            Line::BadMarker => self.anomaly(AnomalyKind::BadMarker, raw),
            Line::Ignored => {}
            Line::Header(header) => self.state = ParserState::Collecting(header),
            Line::Terminator => {
                if let ParserState::Collecting(_) = self.state {
                    self.commit();
                    self.state = ParserState::Terminating;
                }
            }
            Line::Diagnostic => {}
            Line::Data(tokens) => {
                if let ParserState::Collecting(header) = self.state {
                    self.collect(header, &tokens, raw);
                }
            }
        }
    }

    fn collect(&mut self, header: Header, tokens: &[&str], raw: &str) {
        if tokens.len() < header.min_width() {
            self.reset(AnomalyKind::ShortLine, raw);
            return;
        }
        if let Some(col) = header.exit_col {
            match tokens[col].parse::<i64>() {
                Ok(0) => {}
                Ok(_) => {
                    self.anomaly(AnomalyKind::NonZeroExit, raw);
                    return;
                }
                Err(_) => {
                    self.reset(AnomalyKind::BadExitCode, raw);
                    return;
                }
            }
        }
        match tokens[header.metric_col].parse::<f64>() {
            Ok(value) if value.is_finite() => self.pending.push(value),
            _ => self.reset(AnomalyKind::BadMetric, raw),
        }
    }

    /// Records a malformed line and drops the header; samples already
    /// collected under it are kept.
    fn reset(&mut self, kind: AnomalyKind, raw: &str) {
        self.anomaly(kind, raw);
        self.commit();
        self.state = ParserState::SeekingHeader;
    }

    fn anomaly(&mut self, kind: AnomalyKind, raw: &str) {
        tracing::debug!(line = self.line_no, ?kind, "parse anomaly");
        self.out.anomalies.push(ParseAnomaly {
            line: self.line_no,
            kind,
            text: raw.trim().to_string(),
        });
    }

    fn commit(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        self.out
            .matrix
            .extend(&self.condition, &self.pending, self.config.max_per_condition);
        self.pending.clear();
    }

    /// Commits anything still pending and returns the result.
    pub fn finish(mut self) -> ParseOutput {
        self.commit();
        self.out
    }
}

/// Parses a whole log held in memory.
pub fn parse_str(config: &ParserConfig, text: &str) -> ParseOutput {
    let mut parser = LogParser::new(config);
    for line in text.lines() {
        parser.feed(line);
    }
    parser.finish()
}

/// Parses a log file. A missing file is an empty log.
pub fn parse_file(config: &ParserConfig, path: &Path) -> io::Result<ParseOutput> {
    match fs::read(path) {
        Ok(bytes) => Ok(parse_str(config, &String::from_utf8_lossy(&bytes))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "log does not exist yet");
            Ok(ParseOutput::default())
        }
        Err(e) => Err(e),
    }
}
