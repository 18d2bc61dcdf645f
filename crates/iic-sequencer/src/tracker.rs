//! Visit and exposure bookkeeping.
//!
//! The [`VisitTracker`] allocates visit and exposure identifiers, owns their
//! records and forwards every change to the [`PersistenceSink`]. Sink calls
//! are spawned and never awaited, so a slow or failing database cannot stall
//! an exposure.
//!
//! Records outlive their sequence: they stay queryable until
//! [`VisitTracker::prune_before`] drops them.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn, Instrument};

use iic_core::error::{SeqResult, SequenceError};
use iic_core::ids::{ExposureId, IdAllocator, SequenceId, VisitId};
use iic_core::persistence::{
    ExposureRecord, ExposureStatus, PersistenceSink, VisitRecord, VisitStatus,
};
use iic_core::resource::ResourceName;

/// Final outcome reported for an exposure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExposureOutcome {
    /// Read out successfully.
    Done,
    /// Failed with a reason.
    Failed(String),
}

#[derive(Default)]
struct TrackerState {
    visits: BTreeMap<VisitId, VisitRecord>,
    exposures: BTreeMap<ExposureId, ExposureRecord>,
    by_step: HashMap<(VisitId, ResourceName, usize), ExposureId>,
    active: HashMap<SequenceId, VisitId>,
}

/// Owner of visit and exposure records.
pub struct VisitTracker {
    visit_ids: IdAllocator,
    exposure_ids: IdAllocator,
    sink: Arc<dyn PersistenceSink>,
    state: Mutex<TrackerState>,
}

impl std::fmt::Debug for VisitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VisitTracker")
            .field("visits", &state.visits.len())
            .field("exposures", &state.exposures.len())
            .field("active", &state.active.len())
            .finish()
    }
}

impl VisitTracker {
    /// Tracker allocating visits from `first_visit_id` and pushing to `sink`.
    pub fn new(sink: Arc<dyn PersistenceSink>, first_visit_id: u64) -> Self {
        Self {
            visit_ids: IdAllocator::starting_at(first_visit_id),
            exposure_ids: IdAllocator::default(),
            sink,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Opens a visit for `sequence`.
    ///
    /// Fails if the sequence already has an active visit.
    pub fn begin_visit(&self, sequence: SequenceId) -> SeqResult<VisitId> {
        let record = {
            let mut state = self.state.lock();
            if let Some(open) = state.active.get(&sequence) {
                return Err(SequenceError::Tracker(format!(
                    "{sequence} already has active {open}"
                )));
            }
            let id: VisitId = self.visit_ids.next();
            let record = VisitRecord {
                id,
                sequence,
                exposures: Vec::new(),
                status: VisitStatus::Active,
                started_at: Utc::now(),
                ended_at: None,
            };
            state.active.insert(sequence, id);
            state.visits.insert(id, record.clone());
            record
        };
        debug!(sequence_id = %sequence, visit_id = %record.id, "Visit opened");
        let id = record.id;
        self.push_visit(record);
        Ok(id)
    }

    /// Active visit of `sequence`, if any.
    pub fn active_visit(&self, sequence: SequenceId) -> Option<VisitId> {
        self.state.lock().active.get(&sequence).copied()
    }

    /// Returns the exposure for `(visit, camera, step)`, creating it on first
    /// call. A retried step gets the same identifier back.
    pub fn begin_exposure(
        &self,
        visit: VisitId,
        camera: &ResourceName,
        step_index: usize,
    ) -> SeqResult<ExposureId> {
        let (record, visit_record) = {
            let mut state = self.state.lock();
            let key = (visit, camera.clone(), step_index);
            if let Some(existing) = state.by_step.get(&key) {
                return Ok(*existing);
            }
            let visit_record = state
                .visits
                .get_mut(&visit)
                .ok_or_else(|| SequenceError::Tracker(format!("unknown {visit}")))?;
            if visit_record.status != VisitStatus::Active {
                return Err(SequenceError::Tracker(format!("{visit} is closed")));
            }
            let id: ExposureId = self.exposure_ids.next();
            visit_record.exposures.push(id);
            let visit_record = visit_record.clone();
            let record = ExposureRecord {
                id,
                visit,
                camera: camera.clone(),
                step_index,
                status: ExposureStatus::Pending,
                started_at: None,
                ended_at: None,
                failure: None,
            };
            state.by_step.insert(key, id);
            state.exposures.insert(id, record.clone());
            (record, visit_record)
        };
        debug!(visit_id = %visit, exposure_id = %record.id, resource = %camera, "Exposure created");
        self.push_visit(visit_record);
        self.push_exposure(record.clone());
        Ok(record.id)
    }

    /// `Pending -> Exposing`. Stamps the start time on first entry.
    pub fn mark_exposing(&self, id: ExposureId) -> SeqResult<()> {
        self.update_exposure(id, |record| {
            if record.started_at.is_none() {
                record.started_at = Some(Utc::now());
            }
            record.failure = None;
            record.status = ExposureStatus::Exposing;
        })
    }

    /// `Exposing -> Reading`.
    pub fn mark_reading(&self, id: ExposureId) -> SeqResult<()> {
        self.update_exposure(id, |record| {
            record.status = ExposureStatus::Reading;
        })
    }

    /// Finalizes an exposure.
    pub fn complete_exposure(&self, id: ExposureId, outcome: ExposureOutcome) -> SeqResult<()> {
        self.update_exposure(id, |record| {
            record.ended_at = Some(Utc::now());
            match outcome {
                ExposureOutcome::Done => record.status = ExposureStatus::Done,
                ExposureOutcome::Failed(reason) => {
                    record.status = ExposureStatus::Failed;
                    record.failure = Some(reason);
                }
            }
        })
    }

    fn update_exposure(
        &self,
        id: ExposureId,
        change: impl FnOnce(&mut ExposureRecord),
    ) -> SeqResult<()> {
        let record = {
            let mut state = self.state.lock();
            let record = state
                .exposures
                .get_mut(&id)
                .ok_or_else(|| SequenceError::Tracker(format!("unknown {id}")))?;
            change(record);
            record.clone()
        };
        debug!(exposure_id = %id, status = ?record.status, "Exposure updated");
        self.push_exposure(record);
        Ok(())
    }

    /// Whether every exposure of `visit` is `Done` or `Failed`.
    pub fn all_terminal(&self, visit: VisitId) -> bool {
        let state = self.state.lock();
        state.visits.get(&visit).is_some_and(|v| {
            v.exposures
                .iter()
                .filter_map(|id| state.exposures.get(id))
                .all(|e| e.status.is_terminal())
        })
    }

    /// Marks every unfinished exposure of `visit` failed with `reason`.
    ///
    /// Returns how many were failed.
    pub fn fail_unfinished(&self, visit: VisitId, reason: &str) -> usize {
        let pending: Vec<ExposureId> = {
            let state = self.state.lock();
            state
                .visits
                .get(&visit)
                .map(|v| {
                    v.exposures
                        .iter()
                        .filter(|id| {
                            state
                                .exposures
                                .get(id)
                                .is_some_and(|e| !e.status.is_terminal())
                        })
                        .copied()
                        .collect()
                })
                .unwrap_or_default()
        };
        for id in &pending {
            // Only fails if the record vanished, which pruning never does to
            // an open visit.
            let _ = self.complete_exposure(*id, ExposureOutcome::Failed(reason.to_string()));
        }
        pending.len()
    }

    /// Closes `visit` with `status`.
    ///
    /// Closing as `Finished` requires every exposure to be terminal.
    pub fn finish_visit(&self, visit: VisitId, status: VisitStatus) -> SeqResult<()> {
        if status == VisitStatus::Finished && !self.all_terminal(visit) {
            return Err(SequenceError::Tracker(format!(
                "{visit} still has exposures in flight"
            )));
        }
        let record = {
            let mut state = self.state.lock();
            let record = state
                .visits
                .get_mut(&visit)
                .ok_or_else(|| SequenceError::Tracker(format!("unknown {visit}")))?;
            if record.status != VisitStatus::Active {
                return Err(SequenceError::Tracker(format!("{visit} already closed")));
            }
            record.status = status;
            record.ended_at = Some(Utc::now());
            let record = record.clone();
            state.active.remove(&record.sequence);
            record
        };
        debug!(visit_id = %visit, status = ?status, "Visit closed");
        self.push_visit(record);
        Ok(())
    }

    /// Snapshot of a visit.
    pub fn visit(&self, id: VisitId) -> Option<VisitRecord> {
        self.state.lock().visits.get(&id).cloned()
    }

    /// Snapshot of an exposure.
    pub fn exposure(&self, id: ExposureId) -> Option<ExposureRecord> {
        self.state.lock().exposures.get(&id).cloned()
    }

    /// Exposures of `visit`, in creation order.
    pub fn exposures_for(&self, visit: VisitId) -> Vec<ExposureRecord> {
        let state = self.state.lock();
        state
            .visits
            .get(&visit)
            .map(|v| {
                v.exposures
                    .iter()
                    .filter_map(|id| state.exposures.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Visits opened by `sequence`, oldest first.
    pub fn visits_for(&self, sequence: SequenceId) -> Vec<VisitRecord> {
        self.state
            .lock()
            .visits
            .values()
            .filter(|v| v.sequence == sequence)
            .cloned()
            .collect()
    }

    /// Drops closed visits (and their exposures) that ended before `cutoff`.
    ///
    /// Returns the number of visits removed.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let expired: Vec<VisitId> = state
            .visits
            .values()
            .filter(|v| v.ended_at.is_some_and(|end| end < cutoff))
            .map(|v| v.id)
            .collect();
        for id in &expired {
            if let Some(visit) = state.visits.remove(id) {
                for exposure in visit.exposures {
                    state.exposures.remove(&exposure);
                }
            }
        }
        state.by_step.retain(|(visit, _, _), _| !expired.contains(visit));
        expired.len()
    }

    fn push_visit(&self, record: VisitRecord) {
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(e) = sink.record_visit(&record).await {
                warn!(visit_id = %record.id, error = %e, "Persistence sink rejected visit record");
            }
        }
        .in_current_span());
    }

    fn push_exposure(&self, record: ExposureRecord) {
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(e) = sink.record_exposure(&record).await {
                warn!(exposure_id = %record.id, error = %e, "Persistence sink rejected exposure record");
            }
        }
        .in_current_span());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use iic_core::persistence::MemorySink;

    fn tracker() -> (VisitTracker, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (VisitTracker::new(sink.clone(), 100), sink)
    }

    #[tokio::test]
    async fn one_active_visit_per_sequence() {
        let (tracker, _) = tracker();
        let seq = SequenceId(1);
        let visit = tracker.begin_visit(seq).unwrap();
        assert_eq!(visit, VisitId(100));
        assert!(matches!(tracker.begin_visit(seq), Err(SequenceError::Tracker(_))));

        // Other sequences are independent.
        assert_eq!(tracker.begin_visit(SequenceId(2)).unwrap(), VisitId(101));

        tracker.finish_visit(visit, VisitStatus::Finished).unwrap();
        assert_eq!(tracker.begin_visit(seq).unwrap(), VisitId(102));
    }

    #[tokio::test]
    async fn retried_step_reuses_exposure_id() {
        let (tracker, _) = tracker();
        let visit = tracker.begin_visit(SequenceId(1)).unwrap();
        let b1 = ResourceName::arm("b1");
        let r1 = ResourceName::arm("r1");

        let first = tracker.begin_exposure(visit, &b1, 3).unwrap();
        let again = tracker.begin_exposure(visit, &b1, 3).unwrap();
        let other_cam = tracker.begin_exposure(visit, &r1, 3).unwrap();
        let next_step = tracker.begin_exposure(visit, &b1, 4).unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other_cam);
        assert!(next_step > other_cam);
        assert_eq!(tracker.visit(visit).unwrap().exposures.len(), 3);
    }

    #[tokio::test]
    async fn exposure_lifecycle() {
        let (tracker, _) = tracker();
        let visit = tracker.begin_visit(SequenceId(1)).unwrap();
        let id = tracker.begin_exposure(visit, &ResourceName::arm("b1"), 0).unwrap();

        tracker.mark_exposing(id).unwrap();
        tracker.mark_reading(id).unwrap();
        assert!(!tracker.all_terminal(visit));
        assert!(tracker.finish_visit(visit, VisitStatus::Finished).is_err());

        tracker.complete_exposure(id, ExposureOutcome::Done).unwrap();
        let record = tracker.exposure(id).unwrap();
        assert_eq!(record.status, ExposureStatus::Done);
        assert!(record.started_at.is_some() && record.ended_at.is_some());
        tracker.finish_visit(visit, VisitStatus::Finished).unwrap();
        assert!(tracker.begin_exposure(visit, &ResourceName::arm("r1"), 1).is_err());
    }

    #[tokio::test]
    async fn abort_fails_unfinished_exposures() {
        let (tracker, _) = tracker();
        let visit = tracker.begin_visit(SequenceId(1)).unwrap();
        let done = tracker.begin_exposure(visit, &ResourceName::arm("b1"), 0).unwrap();
        tracker.complete_exposure(done, ExposureOutcome::Done).unwrap();
        let open = tracker.begin_exposure(visit, &ResourceName::arm("b1"), 1).unwrap();
        tracker.mark_exposing(open).unwrap();

        assert_eq!(tracker.fail_unfinished(visit, "aborted"), 1);
        assert_eq!(tracker.exposure(open).unwrap().failure.as_deref(), Some("aborted"));
        tracker.finish_visit(visit, VisitStatus::Aborted).unwrap();
        assert!(tracker.active_visit(SequenceId(1)).is_none());
    }

    #[tokio::test]
    async fn changes_reach_the_sink() {
        let (tracker, sink) = tracker();
        let visit = tracker.begin_visit(SequenceId(1)).unwrap();
        let id = tracker.begin_exposure(visit, &ResourceName::arm("b1"), 0).unwrap();
        tracker.complete_exposure(id, ExposureOutcome::Done).unwrap();
        tracker.finish_visit(visit, VisitStatus::Finished).unwrap();

        // Let the spawned sink calls run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let visits = sink.visits();
        assert_eq!(visits.last().unwrap().status, VisitStatus::Finished);
        assert_eq!(sink.exposures().last().unwrap().status, ExposureStatus::Done);
    }

    struct FailingSink;

    #[async_trait]
    impl PersistenceSink for FailingSink {
        async fn record_visit(&self, _: &VisitRecord) -> Result<(), SequenceError> {
            Err(SequenceError::Persistence("database down".into()))
        }

        async fn record_exposure(&self, _: &ExposureRecord) -> Result<(), SequenceError> {
            Err(SequenceError::Persistence("database down".into()))
        }
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn sink_failures_are_logged_not_returned() {
        let tracker = VisitTracker::new(Arc::new(FailingSink), 1);
        let visit = tracker.begin_visit(SequenceId(7)).unwrap();
        tracker.finish_visit(visit, VisitStatus::Finished).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(logs_contain("Persistence sink rejected visit record"));
    }

    #[tokio::test]
    async fn pruning_drops_closed_visits_only() {
        let (tracker, _) = tracker();
        let closed = tracker.begin_visit(SequenceId(1)).unwrap();
        tracker.begin_exposure(closed, &ResourceName::arm("b1"), 0).unwrap();
        tracker.fail_unfinished(closed, "test");
        tracker.finish_visit(closed, VisitStatus::Finished).unwrap();
        let open = tracker.begin_visit(SequenceId(2)).unwrap();

        let removed = tracker.prune_before(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(removed, 1);
        assert!(tracker.visit(closed).is_none());
        assert!(tracker.visit(open).is_some());
    }
}
