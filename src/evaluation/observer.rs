//! Per-unit hooks for downstream reporting.
//!
//! Observers see every finished unit as soon as it completes, in completion
//! order. They are for side effects only (progress, persistence); the
//! driver's own results never depend on them.

use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::driver::{UnitFailure, UnitResult};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitEvent {
    Completed(UnitResult),
    Failed(UnitFailure),
}

impl UnitEvent {
    pub fn feature_set(&self) -> &str {
        match self {
            UnitEvent::Completed(result) => &result.feature_set,
            UnitEvent::Failed(failure) => &failure.feature_set,
        }
    }

    pub fn holdout(&self) -> Option<usize> {
        match self {
            UnitEvent::Completed(result) => result.holdout,
            UnitEvent::Failed(failure) => failure.holdout,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    #[error("{0}")]
    Message(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("observer channel closed")]
    Closed,
    #[error("observer worker failed: {0}")]
    Join(String),
}

#[async_trait::async_trait]
pub trait EvaluationObserver: Send + Sync {
    async fn on_unit(&self, event: &UnitEvent) -> Result<(), ObserverError>;
}

#[derive(Debug, Serialize)]
struct UnitLine<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a UnitEvent,
}

/// Appends one JSON line per unit to a file from a background thread.
#[derive(Clone)]
pub struct JsonlUnitObserver {
    sender: mpsc::Sender<String>,
}

pub struct ObserverWorker {
    handle: Option<std::thread::JoinHandle<Result<(), ObserverError>>>,
}

impl ObserverWorker {
    /// Waits for all queued lines to be flushed. Drop every observer clone first.
    pub fn join(mut self) -> Result<(), ObserverError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(ObserverError::Join("observer worker panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl JsonlUnitObserver {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, ObserverWorker), ObserverError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<String>();
        let handle = std::thread::spawn(move || write_lines(file, receiver));
        Ok((
            Self { sender },
            ObserverWorker {
                handle: Some(handle),
            },
        ))
    }
}

#[async_trait::async_trait]
impl EvaluationObserver for JsonlUnitObserver {
    async fn on_unit(&self, event: &UnitEvent) -> Result<(), ObserverError> {
        let line = serde_json::to_string(&UnitLine {
            timestamp: Utc::now(),
            event,
        })
        .map_err(|e| ObserverError::Serde(e.to_string()))?;
        self.sender.send(line).map_err(|_| ObserverError::Closed)
    }
}

fn write_lines(file: std::fs::File, receiver: mpsc::Receiver<String>) -> Result<(), ObserverError> {
    let mut writer = BufWriter::new(file);
    for line in receiver {
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}
