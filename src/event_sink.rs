//! Append-only JSON array sink for raw provider events.
//!
//! [`EventSinkWriter::create`] writes the opening `[` and drops a sibling
//! `<sink>.incomplete` marker. Every [`EventSinkWriter::append`] writes one
//! record and flushes, so a crash mid-fetch keeps everything retrieved so far.
//! [`EventSinkWriter::finish`] writes the closing `]`, syncs the file and
//! removes the marker. A writer dropped without `finish` leaves the marker in
//! place and [`read_sink`] rejects the artifact instead of parsing a truncated
//! array.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::errors::{DigestError, DigestResult};
use crate::event::RawEvent;

const INCOMPLETE_SUFFIX: &str = ".incomplete";

/// Path of the marker that flags `sink` as not yet finalized
pub fn marker_path(sink: &Path) -> PathBuf {
    let mut name = sink
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("sink"));
    name.push(INCOMPLETE_SUFFIX);
    sink.with_file_name(name)
}

/// Streaming writer owned by exactly one fetcher for the duration of a run.
pub struct EventSinkWriter {
    writer: BufWriter<File>,
    marker: PathBuf,
    count: usize,
}

impl EventSinkWriter {
    /// Truncate (or create) the sink and open the JSON array.
    pub fn create(path: impl AsRef<Path>) -> DigestResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| DigestError::io("creating sink directory", e))?;
        }

        let marker = marker_path(&path);
        fs::write(&marker, b"").map_err(|e| DigestError::io("writing incomplete marker", e))?;

        let file = File::create(&path).map_err(|e| DigestError::io("creating sink", e))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(b"[\n")?;
        writer.flush()?;

        Ok(Self {
            writer,
            marker,
            count: 0,
        })
    }

    /// Write one record and flush it to the file.
    pub fn append<T: Serialize>(&mut self, value: &T) -> DigestResult<()> {
        if self.count > 0 {
            self.writer.write_all(b",\n")?;
        }
        serde_json::to_writer(&mut self.writer, value)
            .map_err(|e| DigestError::serialization("appending sink record", e))?;
        self.writer.flush()?;
        self.count += 1;
        Ok(())
    }

    /// Close the array, sync to disk and clear the incomplete marker.
    pub fn finish(mut self) -> DigestResult<usize> {
        self.writer.write_all(b"\n]\n")?;
        self.writer.flush()?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| DigestError::io("syncing sink", e))?;
        match fs::remove_file(&self.marker) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(DigestError::io("removing incomplete marker", e)),
        }
        Ok(self.count)
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// What aggregation found at a sink path
#[derive(Debug)]
pub enum SinkContents {
    /// Nothing was ever written (provider skipped, or fetch never started)
    Missing,
    Events(Vec<RawEvent>),
}

/// Load a finalized sink.
///
/// An absent sink is `Missing`, not an error. A sink still carrying its
/// incomplete marker, or one that does not parse, is `MalformedInput`.
pub fn read_sink(path: impl AsRef<Path>) -> DigestResult<SinkContents> {
    let path = path.as_ref();

    if marker_path(path).exists() {
        return Err(DigestError::malformed(
            path,
            "sink was never finalized (interrupted fetch)",
        ));
    }

    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(SinkContents::Missing),
        Err(e) => return Err(DigestError::malformed(path, format!("unreadable: {e}"))),
    };

    let events: Vec<RawEvent> = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| DigestError::malformed(path, e.to_string()))?;
    Ok(SinkContents::Events(events))
}
