use tracing::debug;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// How far each end of a requested slot range is pulled inward before it is
/// compared (closed-range) against the existing slots of its shift. One minute
/// lets back-to-back slots share a boundary instant.
pub const SLOT_BOUNDARY_NUDGE_SECS: Secs = 60;

/// Slots of `shift` that `window` collides with, in start-time order.
pub fn overlapping_slots<'a>(
    shift: &'a ShiftState,
    window: &SlotWindow,
    exclude: Option<Id>,
    nudge: Secs,
) -> Vec<&'a Slot> {
    shift
        .slots
        .iter()
        .filter(|s| Some(s.id) != exclude)
        .filter(|s| window.collides(&s.window(), nudge))
        .collect()
}

/// A slot must span at least two nudges, otherwise the narrowed range is empty
/// and the slot could sit inside another one undetected.
fn validate_slot_input(input: &SlotInput, nudge: Secs) -> Result<(), EngineError> {
    if input.start_time >= input.end_time {
        return Err(EngineError::Validation(format!(
            "slot must start before it ends ({} >= {})",
            input.start_time, input.end_time
        )));
    }
    let window = SlotWindow::new(input.start_time, input.end_time);
    if window.end - window.start < 2 * nudge {
        return Err(EngineError::Validation(format!(
            "slot {}-{} is shorter than {}s",
            input.start_time,
            input.end_time,
            2 * nudge
        )));
    }
    if input.code.len() > MAX_NAME_LEN || input.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("slot code or name too long"));
    }
    Ok(())
}

impl Engine {
    fn check_overlap(
        &self,
        shift: &ShiftState,
        input: &SlotInput,
        exclude: Option<Id>,
    ) -> Result<(), EngineError> {
        let window = SlotWindow::new(input.start_time, input.end_time);
        let hits: Vec<Id> = overlapping_slots(shift, &window, exclude, self.config.slot_nudge_secs)
            .into_iter()
            .map(|s| s.id)
            .collect();
        if hits.is_empty() {
            return Ok(());
        }
        metrics::counter!(crate::observability::SLOT_OVERLAPS_TOTAL).increment(1);
        debug!(
            "slot {}-{} overlaps {hits:?} in shift {}",
            input.start_time, input.end_time, shift.info.id
        );
        Err(EngineError::Overlap(hits))
    }

    pub async fn create_slot(&self, shift_id: Id, input: SlotInput) -> Result<Slot, EngineError> {
        validate_slot_input(&input, self.config.slot_nudge_secs)?;
        let shift = self
            .get_shift(&shift_id)
            .ok_or(EngineError::NotFound(Entity::Shift, shift_id))?;
        let mut guard = shift.write().await;
        if guard.slots.len() >= MAX_SLOTS_PER_SHIFT {
            return Err(EngineError::LimitExceeded("too many slots in shift"));
        }
        self.check_overlap(&guard, &input, None)?;

        let slot = Slot {
            id: self.next_id(),
            shift_id,
            code: input.code,
            name: input.name,
            start_time: input.start_time,
            end_time: input.end_time,
            is_practical: input.is_practical,
        };
        let event = Event::SlotCreated { slot: slot.clone() };
        self.persist_to_shift(&mut guard, &event).await?;
        debug!("created slot {} in shift {shift_id}", slot.id);
        Ok(slot)
    }

    pub async fn update_slot(&self, id: Id, input: SlotInput) -> Result<Slot, EngineError> {
        validate_slot_input(&input, self.config.slot_nudge_secs)?;
        let shift_id = self
            .slot_to_shift
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(Entity::Slot, id))?;
        let shift = self
            .get_shift(&shift_id)
            .ok_or(EngineError::NotFound(Entity::Shift, shift_id))?;
        let mut guard = shift.write().await;
        if guard.slot(id).is_none() {
            return Err(EngineError::NotFound(Entity::Slot, id));
        }
        self.check_overlap(&guard, &input, Some(id))?;

        let slot = Slot {
            id,
            shift_id,
            code: input.code,
            name: input.name,
            start_time: input.start_time,
            end_time: input.end_time,
            is_practical: input.is_practical,
        };
        let event = Event::SlotUpdated { slot: slot.clone() };
        self.persist_to_shift(&mut guard, &event).await?;
        debug!("updated slot {id}");
        Ok(slot)
    }

    /// Delete a slot and every allocation booked into it, across all
    /// timetables of the shift. Returns the removed allocation ids.
    pub async fn delete_slot(&self, id: Id) -> Result<Vec<Id>, EngineError> {
        let shift_id = self
            .slot_to_shift
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(Entity::Slot, id))?;
        let shift = self
            .get_shift(&shift_id)
            .ok_or(EngineError::NotFound(Entity::Shift, shift_id))?;
        let mut shift_guard = shift.write().await;
        if shift_guard.slot(id).is_none() {
            return Err(EngineError::NotFound(Entity::Slot, id));
        }

        // Acquire timetable write locks in sorted order to prevent deadlocks.
        let mut time_table_ids = shift_guard.time_tables.clone();
        time_table_ids.sort_unstable();
        let mut removed = Vec::new();
        for tt_id in time_table_ids {
            let Some(table) = self.get_time_table_state(&tt_id) else {
                continue;
            };
            let mut table_guard = table.write().await;
            for allocation_id in table_guard.ids_in_slot(id) {
                let event = Event::AllocationDeleted {
                    id: allocation_id,
                    time_table_id: tt_id,
                };
                self.persist_to_time_table(&mut table_guard, &event).await?;
                removed.push(allocation_id);
            }
        }

        let event = Event::SlotDeleted { id, shift_id };
        self.persist_to_shift(&mut shift_guard, &event).await?;
        debug!("deleted slot {id}, cascaded {} allocations", removed.len());
        Ok(removed)
    }
}
