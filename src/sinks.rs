use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::model::{Booking, DailySummary};

#[derive(Debug)]
pub enum SinkError {
    Io(std::io::Error),
    Encode(serde_json::Error),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Io(e) => write!(f, "sink I/O error: {e}"),
            SinkError::Encode(e) => write!(f, "sink encode error: {e}"),
        }
    }
}

impl std::error::Error for SinkError {}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::Io(e)
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(e: serde_json::Error) -> Self {
        SinkError::Encode(e)
    }
}

/// Append-only writer for per-day aggregates.
#[async_trait]
pub trait StatisticsSink: Send + Sync {
    async fn append_daily(&self, summary: &DailySummary) -> Result<(), SinkError>;
}

/// Receives terminal bookings before the retention sweep may purge them.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn archive(&self, bookings: &[Booking]) -> Result<(), SinkError>;
}

/// One JSON object per line, appended to a file.
pub struct JsonlSink {
    path: PathBuf,
    // Serializes appends so lines from concurrent writers never interleave.
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn append<T: Serialize>(&self, records: &[T]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.sync_data().await?;
        Ok(())
    }
}

#[async_trait]
impl StatisticsSink for JsonlSink {
    async fn append_daily(&self, summary: &DailySummary) -> Result<(), SinkError> {
        self.append(std::slice::from_ref(summary)).await
    }
}

#[async_trait]
impl ArchiveSink for JsonlSink {
    async fn archive(&self, bookings: &[Booking]) -> Result<(), SinkError> {
        self.append(bookings).await
    }
}

pub struct NullSink;

#[async_trait]
impl StatisticsSink for NullSink {
    async fn append_daily(&self, _summary: &DailySummary) -> Result<(), SinkError> {
        Ok(())
    }
}

#[async_trait]
impl ArchiveSink for NullSink {
    async fn archive(&self, _bookings: &[Booking]) -> Result<(), SinkError> {
        Ok(())
    }
}
