//! Visit and exposure records, and the persistence hook they are pushed to.
//!
//! The tracker owns the live records and calls a [`PersistenceSink`] on every
//! change. Sinks are best-effort: the tracker logs their failures and never
//! waits on them from the hardware path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::SequenceError;
use crate::ids::{ExposureId, SequenceId, VisitId};
use crate::resource::ResourceName;

/// Lifecycle of a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitStatus {
    /// Accepting exposures.
    Active,
    /// Closed normally.
    Finished,
    /// Closed because its sequence was aborted or failed.
    Aborted,
}

/// Lifecycle of one camera integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureStatus {
    /// Identifier issued, command not yet dispatched.
    Pending,
    /// Integrating.
    Exposing,
    /// Detector readout.
    Reading,
    /// Completed and recorded.
    Done,
    /// The device reported a failure or the exposure was interrupted.
    Failed,
}

impl ExposureStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExposureStatus::Done | ExposureStatus::Failed)
    }
}

/// Snapshot of a visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitRecord {
    /// Visit identifier.
    pub id: VisitId,
    /// Sequence that opened the visit.
    pub sequence: SequenceId,
    /// Exposures in issue order.
    pub exposures: Vec<ExposureId>,
    /// Current status.
    pub status: VisitStatus,
    /// When the visit was opened.
    pub started_at: DateTime<Utc>,
    /// When the visit was closed.
    pub ended_at: Option<DateTime<Utc>>,
}

/// Snapshot of an exposure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureRecord {
    /// Exposure identifier.
    pub id: ExposureId,
    /// Owning visit.
    pub visit: VisitId,
    /// Camera resource.
    pub camera: ResourceName,
    /// Index of the step that produced it.
    pub step_index: usize,
    /// Current status.
    pub status: ExposureStatus,
    /// Dispatch time.
    pub started_at: Option<DateTime<Utc>>,
    /// Time a terminal status was reached.
    pub ended_at: Option<DateTime<Utc>>,
    /// Failure reason, when `status` is `Failed`.
    pub failure: Option<String>,
}

/// Destination for visit and exposure records.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Records the current state of a visit.
    async fn record_visit(&self, visit: &VisitRecord) -> Result<(), SequenceError>;

    /// Records the current state of an exposure.
    async fn record_exposure(&self, exposure: &ExposureRecord) -> Result<(), SequenceError>;
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl PersistenceSink for NullSink {
    async fn record_visit(&self, _visit: &VisitRecord) -> Result<(), SequenceError> {
        Ok(())
    }

    async fn record_exposure(&self, _exposure: &ExposureRecord) -> Result<(), SequenceError> {
        Ok(())
    }
}

/// In-memory sink keeping every record it receives.
#[derive(Debug, Default)]
pub struct MemorySink {
    visits: Mutex<Vec<VisitRecord>>,
    exposures: Mutex<Vec<ExposureRecord>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All visit records received so far, in arrival order.
    pub fn visits(&self) -> Vec<VisitRecord> {
        self.visits.lock().clone()
    }

    /// All exposure records received so far, in arrival order.
    pub fn exposures(&self) -> Vec<ExposureRecord> {
        self.exposures.lock().clone()
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn record_visit(&self, visit: &VisitRecord) -> Result<(), SequenceError> {
        self.visits.lock().push(visit.clone());
        Ok(())
    }

    async fn record_exposure(&self, exposure: &ExposureRecord) -> Result<(), SequenceError> {
        self.exposures.lock().push(exposure.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_exposure_statuses() {
        assert!(ExposureStatus::Done.is_terminal());
        assert!(ExposureStatus::Failed.is_terminal());
        assert!(!ExposureStatus::Reading.is_terminal());
        assert!(!ExposureStatus::Pending.is_terminal());
    }

    #[tokio::test]
    async fn memory_sink_keeps_records() {
        let sink = MemorySink::new();
        let visit = VisitRecord {
            id: VisitId(1),
            sequence: SequenceId(1),
            exposures: vec![],
            status: VisitStatus::Active,
            started_at: Utc::now(),
            ended_at: None,
        };
        sink.record_visit(&visit).await.unwrap();
        assert_eq!(sink.visits(), vec![visit]);
        assert!(sink.exposures().is_empty());
    }
}
