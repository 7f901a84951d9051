use std::fmt;

use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// Integer key shared by every entity.
pub type Id = u64;

/// Seconds since midnight. Slot ranges are compared in this unit.
pub type Secs = i64;

pub fn secs_of_day(t: NaiveTime) -> Secs {
    t.num_seconds_from_midnight() as Secs
}

// ── Reference data ───────────────────────────────────────────────

/// A weekday definition, shared by every institution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Day {
    pub id: Id,
    pub name: String,
    pub number: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftInfo {
    pub id: Id,
    pub institution_id: Id,
    /// e.g. "Morning", "Evening"
    pub kind: String,
    /// e.g. "INTER", "BS", "ADP"
    pub program_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefKind {
    Teacher,
    Room,
    Course,
    Section,
}

/// A teacher, room, course or section as far as scheduling cares: who owns it,
/// and which program type it is restricted to (rooms and sections only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub kind: RefKind,
    pub id: Id,
    pub institution_id: Id,
    pub program_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeTable {
    pub id: Id,
    pub shift_id: Id,
    pub title: String,
    pub description: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Entity names used in not-found errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Allocation,
    Slot,
    Shift,
    TimeTable,
    Day,
    Teacher,
    Room,
    Course,
    Section,
}

impl From<RefKind> for Entity {
    fn from(kind: RefKind) -> Self {
        match kind {
            RefKind::Teacher => Entity::Teacher,
            RefKind::Room => Entity::Room,
            RefKind::Course => Entity::Course,
            RefKind::Section => Entity::Section,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Allocation => "allocation",
            Entity::Slot => "slot",
            Entity::Shift => "shift",
            Entity::TimeTable => "timetable",
            Entity::Day => "day",
            Entity::Teacher => "teacher",
            Entity::Room => "room",
            Entity::Course => "course",
            Entity::Section => "section",
        };
        f.write_str(name)
    }
}

// ── Slots ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Id,
    pub shift_id: Id,
    pub code: String,
    pub name: String,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub is_practical: bool,
}

impl Slot {
    pub fn window(&self) -> SlotWindow {
        SlotWindow::new(self.start_time, self.end_time)
    }
}

/// Fields an operator supplies when creating or editing a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInput {
    pub code: String,
    pub name: String,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub is_practical: bool,
}

/// Time-of-day range of a slot, in seconds since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotWindow {
    pub start: Secs,
    pub end: Secs,
}

impl SlotWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start: secs_of_day(start),
            end: secs_of_day(end),
        }
    }

    /// Closed-range comparison after pulling both ends of `self` inward by
    /// `nudge`. With a positive nudge, slots that only touch at a boundary
    /// instant do not collide; with zero they do.
    pub fn collides(&self, existing: &SlotWindow, nudge: Secs) -> bool {
        self.start + nudge <= existing.end && existing.start <= self.end - nudge
    }
}

/// Per-shift state: the shift itself, its slots sorted by start time and the
/// timetables scheduled under it.
#[derive(Debug, Clone)]
pub struct ShiftState {
    pub info: ShiftInfo,
    pub slots: Vec<Slot>,
    pub time_tables: Vec<Id>,
}

impl ShiftState {
    pub fn new(info: ShiftInfo) -> Self {
        Self {
            info,
            slots: Vec::new(),
            time_tables: Vec::new(),
        }
    }

    /// Insert slot maintaining sort order by start time.
    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.start_time, |s| s.start_time)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, id: Id) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(pos))
    }

    pub fn slot(&self, id: Id) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }
}

// ── Allocations ──────────────────────────────────────────────────

/// One cell an operator wants filled. Everything but the timetable, day and
/// slot may still be empty while the cell is being edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocationInput {
    pub time_table_id: Id,
    pub section_id: Option<Id>,
    pub day_id: Id,
    pub slot_id: Id,
    pub teacher_id: Option<Id>,
    pub room_id: Option<Id>,
    pub course_id: Option<Id>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Id,
    pub time_table_id: Id,
    pub section_id: Option<Id>,
    pub day_id: Id,
    pub slot_id: Id,
    pub teacher_id: Option<Id>,
    pub room_id: Option<Id>,
    pub course_id: Option<Id>,
}

impl Allocation {
    pub fn from_input(id: Id, input: &AllocationInput) -> Self {
        Self {
            id,
            time_table_id: input.time_table_id,
            section_id: input.section_id,
            day_id: input.day_id,
            slot_id: input.slot_id,
            teacher_id: input.teacher_id,
            room_id: input.room_id,
            course_id: input.course_id,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.section_id.is_some()
            && self.teacher_id.is_some()
            && self.room_id.is_some()
            && self.course_id.is_some()
    }

    pub fn candidate(&self) -> Candidate {
        Candidate {
            day_id: self.day_id,
            slot_id: self.slot_id,
            teacher_id: self.teacher_id,
            room_id: self.room_id,
            section_id: self.section_id,
        }
    }
}

/// The part of an allocation the exclusivity rules look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Candidate {
    pub day_id: Id,
    pub slot_id: Id,
    pub teacher_id: Option<Id>,
    pub room_id: Option<Id>,
    pub section_id: Option<Id>,
}

impl From<&AllocationInput> for Candidate {
    fn from(input: &AllocationInput) -> Self {
        Self {
            day_id: input.day_id,
            slot_id: input.slot_id,
            teacher_id: input.teacher_id,
            room_id: input.room_id,
            section_id: input.section_id,
        }
    }
}

/// A resource that may be booked at most once per (day, slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Dimension {
    Teacher,
    Room,
    Section,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::Teacher, Dimension::Room, Dimension::Section];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Teacher => "teacher",
            Dimension::Room => "room",
            Dimension::Section => "section",
        }
    }

    pub fn value(&self, candidate: &Candidate) -> Option<Id> {
        match self {
            Dimension::Teacher => candidate.teacher_id,
            Dimension::Room => candidate.room_id,
            Dimension::Section => candidate.section_id,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    pub dimension: Dimension,
    pub allocation_id: Id,
}

/// Every state change, as written to the WAL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    DayRegistered {
        day: Day,
    },
    DayActivationSet {
        institution_id: Id,
        day_id: Id,
        active: bool,
    },
    ShiftCreated {
        shift: ShiftInfo,
    },
    ReferenceRegistered {
        reference: Reference,
    },
    TimeTableCreated {
        time_table: TimeTable,
    },
    SlotCreated {
        slot: Slot,
    },
    SlotUpdated {
        slot: Slot,
    },
    SlotDeleted {
        id: Id,
        shift_id: Id,
    },
    AllocationCreated {
        allocation: Allocation,
    },
    AllocationUpdated {
        allocation: Allocation,
    },
    AllocationDeleted {
        id: Id,
        time_table_id: Id,
    },
    /// Ids below `next` have been handed out. Written by compaction so
    /// deleted ids are never reissued after a restart.
    IdsReserved {
        next: Id,
    },
}

impl Event {
    /// Timetable an event belongs to, for change-feed routing.
    pub fn time_table_id(&self) -> Option<Id> {
        match self {
            Event::AllocationCreated { allocation } | Event::AllocationUpdated { allocation } => {
                Some(allocation.time_table_id)
            }
            Event::AllocationDeleted { time_table_id, .. } => Some(*time_table_id),
            Event::TimeTableCreated { time_table } => Some(time_table.id),
            _ => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Complete allocations of one teacher inside one currently valid timetable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadEntry {
    pub time_table_id: Id,
    pub allocations: Vec<Allocation>,
}

impl WorkloadEntry {
    pub fn count(&self) -> usize {
        self.allocations.len()
    }
}
