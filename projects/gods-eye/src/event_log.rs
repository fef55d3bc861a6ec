// Append-only detection history
//
// Every event is written to a CSV file and flushed to disk before `append`
// returns. The newest events are also kept in memory for `/logs`.

use crate::error::LogCorruption;
use crate::pipeline::types::DetectionEvent;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const DEFAULT_MEMORY_CAPACITY: usize = 1000;
const HEADER: &str = "timestamp,num_persons,confidence_avg";

#[derive(Serialize, Deserialize, Debug)]
struct EventRecord {
    timestamp: String,
    num_persons: u32,
    confidence_avg: String,
}

impl From<&DetectionEvent> for EventRecord {
    fn from(event: &DetectionEvent) -> Self {
        Self {
            timestamp: event.timestamp.to_rfc3339(),
            num_persons: event.num_persons,
            confidence_avg: format!("{:.2}", event.confidence),
        }
    }
}

impl TryFrom<EventRecord> for DetectionEvent {
    type Error = String;

    fn try_from(record: EventRecord) -> std::result::Result<Self, Self::Error> {
        let timestamp = DateTime::parse_from_rfc3339(record.timestamp.trim())
            .map_err(|e| format!("bad timestamp {:?}: {}", record.timestamp, e))?
            .with_timezone(&Utc);
        let confidence: f32 = record
            .confidence_avg
            .trim()
            .parse()
            .map_err(|_| format!("bad confidence {:?}", record.confidence_avg))?;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(format!("confidence {} out of range", confidence));
        }
        Ok(DetectionEvent {
            timestamp,
            num_persons: record.num_persons,
            confidence,
        })
    }
}

struct Inner {
    writer: csv::Writer<File>,
    recent: VecDeque<DetectionEvent>,
}

pub struct EventLog {
    path: PathBuf,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl EventLog {
    /// Open the log at `path`, creating it with a header if needed, and load
    /// the newest `capacity` events into memory.
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let path = path.into();
        let capacity = capacity.max(1);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("Failed to open detection log {:?}", path))?;

        let len = file.metadata()?.len();
        if len == 0 {
            writeln!(file, "{}", HEADER)?;
            file.sync_data()?;
        } else if !ends_with_newline(&mut file, len)? {
            tracing::warn!(
                "Detection log {:?} ends with a partial record; terminating it",
                path
            );
            writeln!(file)?;
            file.sync_data()?;
        }

        let recent = load_recent(&path, capacity)?;
        tracing::info!(
            "Detection log {:?} opened with {} recent events",
            path,
            recent.len()
        );

        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        Ok(Self {
            path,
            capacity,
            inner: Mutex::new(Inner { writer, recent }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append one event.
    pub fn append(&self, event: &DetectionEvent) -> Result<()> {
        let mut inner = self.lock();
        inner.writer.serialize(EventRecord::from(event))?;
        inner.writer.flush()?;
        inner.writer.get_ref().sync_data()?;

        inner.recent.push_back(event.clone());
        while inner.recent.len() > self.capacity {
            inner.recent.pop_front();
        }
        Ok(())
    }

    /// Up to `limit` most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<DetectionEvent> {
        let inner = self.lock();
        let skip = inner.recent.len().saturating_sub(limit);
        inner.recent.iter().skip(skip).cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn ends_with_newline(file: &mut File, len: u64) -> Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn load_recent(path: &Path, capacity: usize) -> Result<VecDeque<DetectionEvent>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to read detection log {:?}", path))?;

    let mut recent = VecDeque::with_capacity(capacity.min(4096));
    for (idx, row) in reader.deserialize::<EventRecord>().enumerate() {
        // Line 1 is the header.
        let line = idx as u64 + 2;
        let parsed = row
            .map_err(|e| e.to_string())
            .and_then(DetectionEvent::try_from);
        match parsed {
            Ok(event) => {
                recent.push_back(event);
                if recent.len() > capacity {
                    recent.pop_front();
                }
            }
            Err(reason) => tracing::warn!("{}", LogCorruption { line, reason }),
        }
    }
    Ok(recent)
}
