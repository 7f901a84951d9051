use std::collections::HashMap;

use tracing::info;

use crate::limits::MAX_BATCH_SIZE;
use crate::model::*;

use super::{Engine, EngineError};

/// Teacher/room/course shared by every day of a bulk apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkPayload {
    pub teacher_id: Option<Id>,
    pub room_id: Option<Id>,
    pub course_id: Option<Id>,
}

/// Per-item outcomes of a bulk call, in the order the caller supplied them.
/// Items are tagged by day id (apply) or allocation id (remove).
#[derive(Debug)]
pub struct BulkResult<T> {
    pub items: Vec<(Id, Result<T, EngineError>)>,
}

impl<T> BulkResult<T> {
    pub fn succeeded(&self) -> impl Iterator<Item = (Id, &T)> {
        self.items
            .iter()
            .filter_map(|(id, r)| r.as_ref().ok().map(|v| (*id, v)))
    }

    pub fn failed(&self) -> impl Iterator<Item = (Id, &EngineError)> {
        self.items
            .iter()
            .filter_map(|(id, r)| r.as_ref().err().map(|e| (*id, e)))
    }

    pub fn success_count(&self) -> usize {
        self.items.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.items.len() - self.success_count()
    }

    fn record(&self, op: &'static str) {
        let ok = self.success_count();
        let failed = self.failure_count();
        metrics::counter!(crate::observability::BULK_ITEMS_TOTAL, "op" => op, "outcome" => "ok")
            .increment(ok as u64);
        metrics::counter!(crate::observability::BULK_ITEMS_TOTAL, "op" => op, "outcome" => "failed")
            .increment(failed as u64);
        info!("bulk {op}: {ok} succeeded, {failed} failed");
    }
}

fn check_batch_size(len: usize) -> Result<(), EngineError> {
    if len == 0 {
        return Err(EngineError::EmptyBatch);
    }
    if len > MAX_BATCH_SIZE {
        return Err(EngineError::LimitExceeded("too many items in batch"));
    }
    Ok(())
}

impl Engine {
    /// Write the same payload into (`slot_id`, `section_id`) on each of `days`.
    ///
    /// A day listed in `existing` updates that allocation, any other day
    /// creates one. Each day is its own atomic unit: a failed day neither
    /// blocks nor rolls back the others. Only batch-wide problems (no days,
    /// too many days, unknown timetable) fail the whole call.
    pub async fn bulk_apply(
        &self,
        time_table_id: Id,
        slot_id: Id,
        section_id: Option<Id>,
        days: &[Id],
        payload: BulkPayload,
        existing: &HashMap<Id, Id>,
    ) -> Result<BulkResult<Allocation>, EngineError> {
        check_batch_size(days.len())?;
        self.resolve_time_table(time_table_id)?;

        let mut items = Vec::with_capacity(days.len());
        for &day_id in days {
            let input = AllocationInput {
                time_table_id,
                section_id,
                day_id,
                slot_id,
                teacher_id: payload.teacher_id,
                room_id: payload.room_id,
                course_id: payload.course_id,
            };
            let outcome = match existing.get(&day_id) {
                Some(&id) => self.update_allocation(id, input).await,
                None => self.create_allocation(input).await,
            };
            items.push((day_id, outcome));
        }

        let result = BulkResult { items };
        result.record("apply");
        Ok(result)
    }

    /// Delete each id independently. Ids already gone are per-item failures.
    pub async fn bulk_remove(&self, ids: &[Id]) -> Result<BulkResult<Allocation>, EngineError> {
        check_batch_size(ids.len())?;

        let mut items = Vec::with_capacity(ids.len());
        for &id in ids {
            items.push((id, self.delete_allocation(id).await));
        }

        let result = BulkResult { items };
        result.record("remove");
        Ok(result)
    }
}
