//! Classification and deduplication of raw events into a bounded report.
//!
//! Each event is classified (error, write, read) and counted under a grouping
//! key inside one bucket per class. Errors and writes are listed in full, in
//! first-seen order. Reads are ranked by count and cut to `read_cap` groups;
//! the dropped tail is summarised by a single footer line.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::errors::{DigestError, DigestResult};
use crate::event::{Classification, Provider, RawEvent};
use crate::event_sink::{read_sink, SinkContents};

/// Error messages are clipped to this many characters in report lines
pub const ERROR_MESSAGE_LIMIT: usize = 50;

const ERRORS_HEADER: &str = "## ⚠️ FAILURES & DENIALS";
const WRITES_HEADER: &str = "## 🛠️ INFRA CHANGES";
const READS_HEADER: &str = "## 🔍 DISCOVERY & READS";
const NO_WRITES: &str = "- No infrastructure changes recorded";
const NO_ACTIVITY: &str = "_No activity recorded in this window._";

/// One deduplicated group as it appears in the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportLine {
    pub line: String,
    pub count: usize,
}

/// Read groups that did not make the cut
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Suppressed {
    pub groups: usize,
    pub events: usize,
}

/// Compact, categorized digest of one provider's events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub provider: Provider,
    pub total_events: usize,
    pub errors: Vec<ReportLine>,
    pub writes: Vec<ReportLine>,
    pub reads: Vec<ReportLine>,
    pub suppressed: Suppressed,
    /// Why the underlying fetch ended early, when it did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<String>,
}

impl Report {
    pub fn mark_partial(&mut self, note: impl Into<String>) {
        self.partial = Some(note.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.writes.is_empty() && self.reads.is_empty()
    }

    pub fn title(&self) -> &'static str {
        match self.provider {
            Provider::Aws => "# AWS Security Activity (Compressed)",
            Provider::Azure => "# Azure Activity (Compressed)",
        }
    }

    /// Markdown document handed to the summarizer
    pub fn render(&self) -> String {
        self.to_string()
    }
}

fn write_lines(f: &mut fmt::Formatter<'_>, lines: &[ReportLine]) -> fmt::Result {
    for entry in lines {
        writeln!(f, "- {} | {}x", entry.line, entry.count)?;
    }
    Ok(())
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.title())?;

        if let Some(note) = &self.partial {
            writeln!(f)?;
            writeln!(f, "_Partial: {note}_")?;
        }

        if self.is_empty() {
            writeln!(f)?;
            return writeln!(f, "{NO_ACTIVITY}");
        }

        if !self.errors.is_empty() {
            writeln!(f)?;
            writeln!(f, "{ERRORS_HEADER}")?;
            write_lines(f, &self.errors)?;
        }

        writeln!(f)?;
        writeln!(f, "{WRITES_HEADER}")?;
        if self.writes.is_empty() {
            writeln!(f, "{NO_WRITES}")?;
        } else {
            write_lines(f, &self.writes)?;
        }

        if !self.reads.is_empty() {
            writeln!(f)?;
            writeln!(f, "{READS_HEADER}")?;
            write_lines(f, &self.reads)?;
            if self.suppressed.groups > 0 {
                writeln!(
                    f,
                    "- … {} more groups suppressed ({} events)",
                    self.suppressed.groups, self.suppressed.events
                )?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    actor: String,
    action: String,
    error_code: Option<String>,
}

impl GroupKey {
    fn of(event: &RawEvent, error_code: Option<&str>) -> Self {
        Self {
            actor: event.actor.clone(),
            action: event.action.clone(),
            error_code: error_code.map(str::to_string),
        }
    }
}

struct Group {
    line: String,
    count: usize,
}

/// Grouping key -> count, remembering first-seen order and the first sample line
#[derive(Default)]
struct Bucket {
    index: HashMap<GroupKey, usize>,
    groups: Vec<Group>,
}

impl Bucket {
    fn add(&mut self, key: GroupKey, sample: impl FnOnce() -> String) {
        match self.index.get(&key) {
            Some(&slot) => self.groups[slot].count += 1,
            None => {
                self.index.insert(key, self.groups.len());
                self.groups.push(Group {
                    line: sample(),
                    count: 1,
                });
            }
        }
    }

    fn into_lines(self) -> Vec<ReportLine> {
        self.groups
            .into_iter()
            .map(|g| ReportLine {
                line: g.line,
                count: g.count,
            })
            .collect()
    }
}

fn plain_line(event: &RawEvent) -> String {
    format!("{} | {}", event.actor, event.action)
}

fn error_line(event: &RawEvent, code: &str) -> String {
    match event.error_message.as_deref().filter(|m| !m.is_empty()) {
        Some(message) => {
            let clipped: String = message.chars().take(ERROR_MESSAGE_LIMIT).collect();
            format!("{} | {} | {} ({})", event.actor, event.action, code, clipped)
        }
        None => format!("{} | {} | {}", event.actor, event.action, code),
    }
}

/// Outcome of aggregating a persisted sink
#[derive(Debug)]
pub enum AggregateOutcome {
    Report(Report),
    /// The sink does not exist
    NoInput,
}

/// Stateless classifier; all dedup state lives inside one `aggregate` call.
#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    read_cap: usize,
}

impl Aggregator {
    pub fn new(read_cap: usize) -> Self {
        Self { read_cap }
    }

    /// Deterministic: the same event sequence always yields the same report.
    pub fn aggregate(&self, provider: Provider, events: &[RawEvent]) -> Report {
        let mut errors = Bucket::default();
        let mut writes = Bucket::default();
        let mut reads = Bucket::default();

        for event in events {
            match event.classify() {
                Classification::Error => {
                    let code = event.error_code().unwrap_or_default();
                    errors.add(GroupKey::of(event, Some(code)), || error_line(event, code));
                }
                Classification::Write => {
                    writes.add(GroupKey::of(event, None), || plain_line(event));
                }
                Classification::Read => {
                    reads.add(GroupKey::of(event, None), || plain_line(event));
                }
            }
        }

        let mut reads = reads.into_lines();
        // stable sort keeps first-seen order among equal counts
        reads.sort_by(|a, b| b.count.cmp(&a.count));
        let dropped = reads.split_off(reads.len().min(self.read_cap));
        let suppressed = Suppressed {
            groups: dropped.len(),
            events: dropped.iter().map(|g| g.count).sum(),
        };

        Report {
            provider,
            total_events: events.len(),
            errors: errors.into_lines(),
            writes: writes.into_lines(),
            reads,
            suppressed,
            partial: None,
        }
    }

    /// Aggregate a finalized sink. An absent sink is `NoInput`; an unfinished
    /// or corrupt one is `MalformedInput`.
    pub fn aggregate_sink(
        &self,
        provider: Provider,
        path: impl AsRef<Path>,
    ) -> DigestResult<AggregateOutcome> {
        match read_sink(path.as_ref())? {
            SinkContents::Missing => {
                debug!("No sink at {} for {}", path.as_ref().display(), provider);
                Ok(AggregateOutcome::NoInput)
            }
            SinkContents::Events(events) => {
                Ok(AggregateOutcome::Report(self.aggregate(provider, &events)))
            }
        }
    }
}

/// Write the rendered report document, creating parent directories.
pub fn write_report(report: &Report, path: impl AsRef<Path>) -> DigestResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| DigestError::io("creating report directory", e))?;
    }
    fs::write(path, report.render()).map_err(|e| DigestError::io("writing report", e))
}
