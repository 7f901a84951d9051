use chrono::NaiveTime;
use tokio::sync::broadcast;

use crate::model::*;

use super::conflict;
use super::slots::overlapping_slots;
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_allocation(&self, id: Id) -> Option<Allocation> {
        let time_table_id = self.allocation_to_time_table.get(&id).map(|e| *e.value())?;
        let table = self.get_time_table_state(&time_table_id)?;
        let guard = table.read().await;
        guard.get(id).copied()
    }

    /// All rows of a timetable ordered by day, slot, then id. Empty for an
    /// unknown timetable.
    pub async fn list_allocations(&self, time_table_id: Id) -> Vec<Allocation> {
        let Some(table) = self.get_time_table_state(&time_table_id) else {
            return Vec::new();
        };
        let guard = table.read().await;
        let mut rows: Vec<Allocation> = guard.iter().copied().collect();
        rows.sort_by_key(|a| (a.day_id, a.slot_id, a.id));
        rows
    }

    /// Slots of a shift in start-time order.
    pub async fn list_slots(&self, shift_id: Id) -> Result<Vec<Slot>, EngineError> {
        let shift = self
            .get_shift(&shift_id)
            .ok_or(EngineError::NotFound(Entity::Shift, shift_id))?;
        let guard = shift.read().await;
        Ok(guard.slots.clone())
    }

    pub async fn get_slot(&self, id: Id) -> Option<Slot> {
        let shift_id = self.slot_to_shift.get(&id).map(|e| *e.value())?;
        let shift = self.get_shift(&shift_id)?;
        let guard = shift.read().await;
        guard.slot(id).cloned()
    }

    pub async fn get_time_table(&self, id: Id) -> Option<TimeTable> {
        let table = self.get_time_table_state(&id)?;
        let guard = table.read().await;
        Some(guard.info.clone())
    }

    /// Slots of `shift_id` a `[start, end]` range would collide with, using the
    /// engine's configured boundary nudge.
    pub async fn find_overlapping_slots(
        &self,
        shift_id: Id,
        start: NaiveTime,
        end: NaiveTime,
        exclude: Option<Id>,
    ) -> Result<Vec<Slot>, EngineError> {
        let shift = self
            .get_shift(&shift_id)
            .ok_or(EngineError::NotFound(Entity::Shift, shift_id))?;
        let guard = shift.read().await;
        let window = SlotWindow::new(start, end);
        Ok(
            overlapping_slots(&guard, &window, exclude, self.config.slot_nudge_secs)
                .into_iter()
                .cloned()
                .collect(),
        )
    }

    /// What writing `candidate` into `time_table_id` would violate right now.
    pub async fn find_conflicts(
        &self,
        time_table_id: Id,
        candidate: &Candidate,
        exclude: Option<Id>,
    ) -> Result<Vec<Conflict>, EngineError> {
        let table = self
            .get_time_table_state(&time_table_id)
            .ok_or_else(|| EngineError::Validation(format!("unknown timetable {time_table_id}")))?;
        let guard = table.read().await;
        Ok(conflict::find_conflicts(&guard, candidate, exclude))
    }

    /// Change feed of one timetable: every applied allocation event.
    pub fn subscribe(&self, time_table_id: Id) -> broadcast::Receiver<Event> {
        self.notify.subscribe(time_table_id)
    }
}
