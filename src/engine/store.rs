use std::collections::HashMap;

use crate::model::*;

/// A unique-index hit: `dimension` is already held by `existing` at the same
/// (day, slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniqueViolation {
    pub dimension: Dimension,
    pub existing: Id,
}

impl From<UniqueViolation> for Conflict {
    fn from(v: UniqueViolation) -> Self {
        Conflict {
            dimension: v.dimension,
            allocation_id: v.existing,
        }
    }
}

/// (dimension, day, slot, value)
type IndexKey = (Dimension, Id, Id, Id);

/// Allocation rows of one timetable.
///
/// Rows are grouped by (day, slot) cell for the conflict scan. Complete rows
/// are additionally held in a unique index per dimension; the index refuses
/// any write that would put two complete rows on the same teacher, room or
/// section in one cell.
#[derive(Debug, Clone)]
pub struct TimetableState {
    pub info: TimeTable,
    pub institution_id: Id,
    pub program_type: String,
    allocations: HashMap<Id, Allocation>,
    /// (day, slot) → allocation ids in that cell
    cells: HashMap<(Id, Id), Vec<Id>>,
    unique: HashMap<IndexKey, Id>,
}

fn index_keys(a: &Allocation) -> Vec<IndexKey> {
    if !a.is_complete() {
        return Vec::new();
    }
    let candidate = a.candidate();
    Dimension::ALL
        .iter()
        .filter_map(|d| d.value(&candidate).map(|v| (*d, a.day_id, a.slot_id, v)))
        .collect()
}

impl TimetableState {
    pub fn new(info: TimeTable, shift: &ShiftInfo) -> Self {
        Self {
            info,
            institution_id: shift.institution_id,
            program_type: shift.program_type.clone(),
            allocations: HashMap::new(),
            cells: HashMap::new(),
            unique: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn get(&self, id: Id) -> Option<&Allocation> {
        self.allocations.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.values()
    }

    /// Rows sitting in one (day, slot) cell.
    pub fn cell(&self, day_id: Id, slot_id: Id) -> impl Iterator<Item = &Allocation> {
        self.cells
            .get(&(day_id, slot_id))
            .into_iter()
            .flatten()
            .filter_map(|id| self.allocations.get(id))
    }

    /// Ids of rows booked into `slot_id` on any day.
    pub fn ids_in_slot(&self, slot_id: Id) -> Vec<Id> {
        let mut ids: Vec<Id> = self
            .allocations
            .values()
            .filter(|a| a.slot_id == slot_id)
            .map(|a| a.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Index entries `a` would collide with, ignoring entries owned by `a` itself.
    pub fn check_unique(&self, a: &Allocation) -> Result<(), Vec<UniqueViolation>> {
        let violations: Vec<UniqueViolation> = index_keys(a)
            .into_iter()
            .filter_map(|key| match self.unique.get(&key) {
                Some(&existing) if existing != a.id => Some(UniqueViolation {
                    dimension: key.0,
                    existing,
                }),
                _ => None,
            })
            .collect();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    pub fn insert(&mut self, a: Allocation) -> Result<(), Vec<UniqueViolation>> {
        self.check_unique(&a)?;
        self.index(&a);
        self.allocations.insert(a.id, a);
        Ok(())
    }

    /// Replace an existing row. Returns the previous version, or `None` if the
    /// row was not present (in which case nothing is written).
    pub fn replace(&mut self, a: Allocation) -> Result<Option<Allocation>, Vec<UniqueViolation>> {
        self.check_unique(&a)?;
        let Some(previous) = self.allocations.get(&a.id).copied() else {
            return Ok(None);
        };
        self.unindex(&previous);
        self.index(&a);
        self.allocations.insert(a.id, a);
        Ok(Some(previous))
    }

    pub fn remove(&mut self, id: Id) -> Option<Allocation> {
        let a = self.allocations.remove(&id)?;
        self.unindex(&a);
        Some(a)
    }

    fn index(&mut self, a: &Allocation) {
        self.cells.entry((a.day_id, a.slot_id)).or_default().push(a.id);
        for key in index_keys(a) {
            self.unique.insert(key, a.id);
        }
    }

    fn unindex(&mut self, a: &Allocation) {
        if let Some(ids) = self.cells.get_mut(&(a.day_id, a.slot_id)) {
            ids.retain(|id| *id != a.id);
            if ids.is_empty() {
                self.cells.remove(&(a.day_id, a.slot_id));
            }
        }
        for key in index_keys(a) {
            if self.unique.get(&key) == Some(&a.id) {
                self.unique.remove(&key);
            }
        }
    }
}
