use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use chrono::{Local, NaiveDate};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::error;
use uuid::Uuid;

use crate::events::{container_topic, Event, EventBus};

/// Lines kept in memory per container.
const RING_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Out,
    Err,
}

impl LogKind {
    fn prefix(self) -> &'static str {
        match self {
            LogKind::Out => "[stdout]",
            LogKind::Err => "[stderr]",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub kind: LogKind,
    pub message: String,
    pub index: u64,
}

struct ActiveFile {
    date: NaiveDate,
    writer: BufWriter<File>,
}

struct SinkInner {
    ring: VecDeque<LogLine>,
    next_index: u64,
    file: Option<ActiveFile>,
    closed: bool,
}

/// Captures one container's output streams: bounded in-memory ring,
/// date-rotated files under `.vertex/logs/`, and fan-out on the bus. A
/// write never fails the producer; disk errors go to the process logger.
pub struct LogSink {
    uuid: Uuid,
    dir: PathBuf,
    bus: EventBus,
    inner: Mutex<SinkInner>,
}

impl LogSink {
    pub fn new(uuid: Uuid, dir: PathBuf, bus: EventBus) -> Self {
        Self {
            uuid,
            dir,
            bus,
            inner: Mutex::new(SinkInner {
                ring: VecDeque::with_capacity(RING_CAPACITY),
                next_index: 0,
                file: None,
                closed: false,
            }),
        }
    }

    /// Re-arms a sink that was closed by a previous stop.
    pub async fn open(&self) {
        self.inner.lock().await.closed = false;
    }

    pub async fn push(&self, kind: LogKind, message: impl Into<String>) {
        let message = message.into();
        let line = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }

            let line = LogLine {
                kind,
                message,
                index: inner.next_index,
            };
            inner.next_index += 1;

            if inner.ring.len() >= RING_CAPACITY {
                inner.ring.pop_front();
            }
            inner.ring.push_back(line.clone());

            if let Err(err) = self.write_to_file(&mut inner, &line) {
                error!(container = %self.uuid, "failed to write log file: {err}");
            }

            line
        };

        self.bus.publish(
            &container_topic(self.uuid),
            Event::LogLine {
                uuid: self.uuid,
                kind: line.kind,
                message: line.message,
            },
        );
    }

    fn write_to_file(&self, inner: &mut SinkInner, line: &LogLine) -> std::io::Result<()> {
        let today = Local::now().date_naive();

        let rotate = match &inner.file {
            Some(active) => active.date != today,
            None => true,
        };
        if rotate {
            if let Some(mut active) = inner.file.take() {
                let _ = active.writer.flush();
            }
            std::fs::create_dir_all(&self.dir)?;
            let path = self.dir.join(format!("{}.log", today.format("%Y-%m-%d")));
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            inner.file = Some(ActiveFile {
                date: today,
                writer: BufWriter::new(file),
            });
        }

        if let Some(active) = &mut inner.file {
            writeln!(active.writer, "{} {}", line.kind.prefix(), line.message)?;
            active.writer.flush()?;
        }
        Ok(())
    }

    /// Snapshot of the in-memory ring, oldest first.
    pub async fn lines(&self) -> Vec<LogLine> {
        self.inner.lock().await.ring.iter().cloned().collect()
    }

    /// Flushes and closes the active file. Later writes are dropped
    /// silently until the sink is opened again.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut active) = inner.file.take() {
            let _ = active.writer.flush();
        }
        inner.closed = true;
    }
}
