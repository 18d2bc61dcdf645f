//! Sequence event stream.
//!
//! Every state change, step boundary, retry, convergence iteration and
//! exposure update is published on a broadcast channel. Subscribers that lag
//! behind lose the oldest events; the executor never waits for them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use iic_core::error::SequenceError;
use iic_core::ids::{ExposureId, SequenceId, VisitId};
use iic_core::persistence::ExposureStatus;

use crate::sequence::{ControlSignal, SequenceState};
use crate::step::StepKind;

/// Event published by the executor and the control surface.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SequenceEvent {
    /// Lifecycle transition.
    StateChanged {
        /// Sequence.
        sequence: SequenceId,
        /// New state.
        state: SequenceState,
        /// Transition time.
        at: DateTime<Utc>,
    },
    /// Control request accepted by the surface.
    Control {
        /// Sequence.
        sequence: SequenceId,
        /// Request.
        signal: ControlSignal,
    },
    /// Pause took effect (`true`) or was lifted (`false`).
    Paused {
        /// Sequence.
        sequence: SequenceId,
        /// Paused flag.
        paused: bool,
    },
    /// A step acquired its locks and started.
    StepStarted {
        /// Sequence.
        sequence: SequenceId,
        /// Step index.
        index: usize,
        /// Step kind.
        kind: StepKind,
        /// Step label.
        label: String,
    },
    /// A step completed.
    StepCompleted {
        /// Sequence.
        sequence: SequenceId,
        /// Step index.
        index: usize,
    },
    /// A failed attempt is about to be retried.
    StepRetry {
        /// Sequence.
        sequence: SequenceId,
        /// Step index.
        index: usize,
        /// Attempt that failed (1-based).
        attempt: u32,
        /// Backoff before the next attempt, in milliseconds.
        delay_ms: u64,
        /// Failure of the attempt.
        error: SequenceError,
    },
    /// One convergence iteration finished.
    Convergence {
        /// Sequence.
        sequence: SequenceId,
        /// Step index.
        index: usize,
        /// Iterations done.
        iteration: u32,
        /// Iteration cap.
        cap: u32,
        /// Latest measurement.
        measurement: Option<f64>,
    },
    /// A visit was opened or closed.
    Visit {
        /// Sequence.
        sequence: SequenceId,
        /// Visit.
        visit: VisitId,
        /// Whether the visit is still open.
        open: bool,
    },
    /// An exposure changed status.
    Exposure {
        /// Sequence.
        sequence: SequenceId,
        /// Exposure.
        exposure: ExposureId,
        /// New status.
        status: ExposureStatus,
    },
    /// Operator note carried by an annotate step.
    Annotation {
        /// Sequence.
        sequence: SequenceId,
        /// Note.
        text: String,
    },
    /// A teardown step failed; the sequence outcome is unaffected.
    TeardownWarning {
        /// Sequence.
        sequence: SequenceId,
        /// Teardown step label.
        label: String,
        /// Failure description.
        error: String,
    },
}

impl SequenceEvent {
    /// Sequence the event belongs to.
    pub fn sequence(&self) -> SequenceId {
        match self {
            SequenceEvent::StateChanged { sequence, .. }
            | SequenceEvent::Control { sequence, .. }
            | SequenceEvent::Paused { sequence, .. }
            | SequenceEvent::StepStarted { sequence, .. }
            | SequenceEvent::StepCompleted { sequence, .. }
            | SequenceEvent::StepRetry { sequence, .. }
            | SequenceEvent::Convergence { sequence, .. }
            | SequenceEvent::Visit { sequence, .. }
            | SequenceEvent::Exposure { sequence, .. }
            | SequenceEvent::Annotation { sequence, .. }
            | SequenceEvent::TeardownWarning { sequence, .. } => *sequence,
        }
    }
}

/// Broadcast fan-out of [`SequenceEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SequenceEvent>,
}

impl EventBus {
    /// Bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes `event`. Having no subscriber is not an error.
    pub fn publish(&self, event: SequenceEvent) {
        let _ = self.sender.send(event);
    }

    /// New subscriber receiving events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SequenceEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(SequenceEvent::StepStarted {
            sequence: SequenceId(1),
            index: 0,
            kind: StepKind::Expose,
            label: "flat".into(),
        });
        bus.publish(SequenceEvent::StepCompleted {
            sequence: SequenceId(1),
            index: 0,
        });
        assert!(matches!(rx.recv().await.unwrap(), SequenceEvent::StepStarted { .. }));
        let done = rx.recv().await.unwrap();
        assert_eq!(done.sequence(), SequenceId(1));
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        EventBus::new(1).publish(SequenceEvent::Annotation {
            sequence: SequenceId(2),
            text: "no one listening".into(),
        });
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(SequenceEvent::Paused {
            sequence: SequenceId(3),
            paused: true,
        })
        .unwrap();
        assert_eq!(json["event"], "paused");
        assert_eq!(json["sequence"], 3);
    }
}
