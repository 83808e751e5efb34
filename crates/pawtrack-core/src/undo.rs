//! Undo of a visit check-in

use std::sync::Arc;

use crate::error::UndoError;
use crate::models::{Change, Collection, EntityId, OperationId, Visit};
use crate::sync::SyncReconciler;

/// Issues compensating operations that return a started visit to "not started".
///
/// Undo is an ordinary update queued behind whatever is already pending for
/// the visit, so the log converges even while the check-in is in flight.
pub struct UndoController {
    reconciler: Arc<SyncReconciler>,
}

impl UndoController {
    pub const fn new(reconciler: Arc<SyncReconciler>) -> Self {
        Self { reconciler }
    }

    /// Queue the compensating update and return its operation id
    pub fn undo(&self, entity_id: &EntityId) -> Result<OperationId, UndoError> {
        let operation_id =
            self.reconciler
                .enqueue_checked(&Collection::visits(), entity_id, |entity| {
                    let visit = entity
                        .and_then(|entity| Visit::from_entity(entity).ok())
                        .ok_or_else(|| UndoError::NotFound(entity_id.to_string()))?;
                    if visit.is_ended() {
                        return Err(UndoError::AlreadyTerminal(entity_id.to_string()));
                    }
                    if !visit.is_started() {
                        return Err(UndoError::NotStarted(entity_id.to_string()));
                    }
                    Ok(Change::Update(Visit::undo_start_patch()))
                })?;

        tracing::info!(
            entity_id = %entity_id,
            operation_id = %operation_id,
            "Queued undo of visit start"
        );
        Ok(operation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{visit, VisitStatus, VisitTimeline};
    use crate::sync::PendingOperationLog;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    fn setup() -> (UndoController, Arc<SyncReconciler>, EntityId) {
        let reconciler = Arc::new(SyncReconciler::new(Arc::new(Mutex::new(
            PendingOperationLog::new(),
        ))));
        let id = EntityId::new("visit-1").unwrap();
        let timeline = VisitTimeline::scheduled(
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap(),
        )
        .unwrap();
        reconciler.enqueue(
            &Collection::visits(),
            &id,
            Change::Create(Visit::creation_patch(&timeline, None, None)),
        );
        (UndoController::new(Arc::clone(&reconciler)), reconciler, id)
    }

    fn visit_of(reconciler: &SyncReconciler, id: &EntityId) -> Visit {
        let entity = reconciler.entity(&Collection::visits(), id).unwrap();
        Visit::from_entity(&entity).unwrap()
    }

    #[test]
    fn test_unknown_visit_is_not_found() {
        let (undo, _, _) = setup();
        let missing = EntityId::new("visit-404").unwrap();
        assert_eq!(
            undo.undo(&missing),
            Err(UndoError::NotFound("visit-404".to_string()))
        );
    }

    #[test]
    fn test_unstarted_visit_cannot_be_undone() {
        let (undo, _, id) = setup();
        assert_eq!(undo.undo(&id), Err(UndoError::NotStarted(id.to_string())));
    }

    #[test]
    fn test_undo_queues_behind_pending_check_in() {
        let (undo, reconciler, id) = setup();
        let check_in = reconciler.enqueue(
            &Collection::visits(),
            &id,
            Change::Update(Visit::check_in_patch()),
        );
        assert!(visit_of(&reconciler, &id).is_started());

        let compensation = undo.undo(&id).unwrap();
        let visit = visit_of(&reconciler, &id);
        assert!(!visit.is_started());
        assert_eq!(visit.status, VisitStatus::Scheduled);

        let log = crate::util::lock(reconciler.log());
        let order: Vec<_> = log.pending_for(&id).iter().map(|op| op.id).collect();
        assert_eq!(order[1..], [check_in, compensation]);
        let undo_op = log.get(compensation).unwrap();
        assert!(undo_op.payload.touches(visit::fields::ACTUAL_START));
    }

    #[test]
    fn test_completed_visit_is_terminal() {
        let (undo, reconciler, id) = setup();
        for patch in [Visit::check_in_patch(), Visit::check_out_patch()] {
            reconciler.enqueue(&Collection::visits(), &id, Change::Update(patch));
        }
        assert_eq!(
            undo.undo(&id),
            Err(UndoError::AlreadyTerminal(id.to_string()))
        );
    }
}
