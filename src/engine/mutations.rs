use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tracing::debug;

use crate::limits::*;
use crate::model::*;

use super::conflict::find_conflicts;
use super::store::{TimetableState, UniqueViolation};
use super::{Engine, EngineError, WalCommand};

fn record_conflicts(conflicts: &[Conflict]) {
    for c in conflicts {
        metrics::counter!(crate::observability::CONFLICTS_TOTAL, "dimension" => c.dimension.as_str())
            .increment(1);
    }
}

/// A unique-index refusal reads exactly like a pre-check conflict.
fn unique_violation(violations: Vec<UniqueViolation>) -> EngineError {
    let conflicts: Vec<Conflict> = violations.into_iter().map(Conflict::from).collect();
    record_conflicts(&conflicts);
    EngineError::Conflict(conflicts)
}

fn check_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

impl Engine {
    // ── Reference data ───────────────────────────────────────

    pub async fn register_day(&self, id: Id, name: String, number: u8) -> Result<(), EngineError> {
        check_name(&name, "day name too long")?;
        let event = Event::DayRegistered {
            day: Day { id, name, number },
        };
        self.persist_global(&event).await
    }

    pub async fn set_day_active(
        &self,
        institution_id: Id,
        day_id: Id,
        active: bool,
    ) -> Result<(), EngineError> {
        if !self.days.contains_key(&day_id) {
            return Err(EngineError::NotFound(Entity::Day, day_id));
        }
        let event = Event::DayActivationSet {
            institution_id,
            day_id,
            active,
        };
        self.persist_global(&event).await
    }

    pub async fn create_shift(
        &self,
        id: Id,
        institution_id: Id,
        kind: String,
        program_type: String,
    ) -> Result<(), EngineError> {
        check_name(&kind, "shift kind too long")?;
        check_name(&program_type, "program type too long")?;
        if self.shifts.contains_key(&id) {
            return Err(EngineError::Validation(format!("shift {id} already exists")));
        }
        let event = Event::ShiftCreated {
            shift: ShiftInfo {
                id,
                institution_id,
                kind,
                program_type,
            },
        };
        self.persist_global(&event).await
    }

    /// Record (or re-record) a teacher, room, course or section handed over by
    /// the institution-scoping collaborator.
    pub async fn register_reference(&self, reference: Reference) -> Result<(), EngineError> {
        if let Some(p) = &reference.program_type {
            check_name(p, "program type too long")?;
        }
        let event = Event::ReferenceRegistered { reference };
        self.persist_global(&event).await
    }

    pub async fn register_teacher(&self, id: Id, institution_id: Id) -> Result<(), EngineError> {
        self.register_reference(Reference {
            kind: RefKind::Teacher,
            id,
            institution_id,
            program_type: None,
        })
        .await
    }

    pub async fn register_course(&self, id: Id, institution_id: Id) -> Result<(), EngineError> {
        self.register_reference(Reference {
            kind: RefKind::Course,
            id,
            institution_id,
            program_type: None,
        })
        .await
    }

    pub async fn register_room(
        &self,
        id: Id,
        institution_id: Id,
        program_type: Option<String>,
    ) -> Result<(), EngineError> {
        self.register_reference(Reference {
            kind: RefKind::Room,
            id,
            institution_id,
            program_type,
        })
        .await
    }

    pub async fn register_section(
        &self,
        id: Id,
        institution_id: Id,
        program_type: Option<String>,
    ) -> Result<(), EngineError> {
        self.register_reference(Reference {
            kind: RefKind::Section,
            id,
            institution_id,
            program_type,
        })
        .await
    }

    pub async fn create_time_table(
        &self,
        id: Id,
        shift_id: Id,
        title: String,
        description: Option<String>,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<TimeTable, EngineError> {
        check_name(&title, "timetable title too long")?;
        if description.as_ref().is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
            return Err(EngineError::LimitExceeded("timetable description too long"));
        }
        if end_date < start_date {
            return Err(EngineError::Validation(format!(
                "timetable ends ({end_date}) before it starts ({start_date})"
            )));
        }
        let shift = self
            .get_shift(&shift_id)
            .ok_or_else(|| EngineError::Validation(format!("unknown shift {shift_id}")))?;
        let mut guard = shift.write().await;
        // Claiming the id in the reverse index is atomic across shifts
        match self.time_table_to_shift.entry(id) {
            Entry::Occupied(_) => {
                return Err(EngineError::Validation(format!("timetable {id} already exists")));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(shift_id);
            }
        }

        let time_table = TimeTable {
            id,
            shift_id,
            title,
            description,
            start_date,
            end_date,
        };
        let event = Event::TimeTableCreated {
            time_table: time_table.clone(),
        };
        if let Err(e) = self.persist_time_table(&mut guard, &event, &time_table).await {
            self.time_table_to_shift.remove(&id);
            return Err(e);
        }
        debug!("created timetable {id} under shift {shift_id}");
        Ok(time_table)
    }

    // ── Allocations ──────────────────────────────────────────

    /// Foreign-key and scope checks for a cell. Every referenced id must be
    /// known, belong to the timetable's institution and (for rooms and
    /// sections) match the shift's program type.
    fn validate_allocation(
        &self,
        shift: &ShiftState,
        table: &TimetableState,
        input: &AllocationInput,
    ) -> Result<(), EngineError> {
        if !self.days.contains_key(&input.day_id) {
            return Err(EngineError::Validation(format!("unknown day {}", input.day_id)));
        }
        let active = self
            .day_activation
            .get(&(table.institution_id, input.day_id))
            .is_some_and(|e| *e.value());
        if !active {
            return Err(EngineError::Validation(format!(
                "day {} is not active for institution {}",
                input.day_id, table.institution_id
            )));
        }
        if shift.slot(input.slot_id).is_none() {
            return Err(EngineError::Validation(format!(
                "slot {} does not belong to shift {}",
                input.slot_id, shift.info.id
            )));
        }

        let refs = [
            (RefKind::Teacher, input.teacher_id),
            (RefKind::Room, input.room_id),
            (RefKind::Course, input.course_id),
            (RefKind::Section, input.section_id),
        ];
        for (kind, id) in refs {
            let Some(id) = id else { continue };
            let entity = Entity::from(kind);
            let reference = self
                .references
                .get(&(kind, id))
                .ok_or_else(|| EngineError::Validation(format!("unknown {entity} {id}")))?;
            if reference.institution_id != table.institution_id {
                return Err(EngineError::Validation(format!(
                    "{entity} {id} belongs to another institution"
                )));
            }
            if let Some(p) = &reference.program_type
                && *p != table.program_type
            {
                return Err(EngineError::Validation(format!(
                    "{entity} {id} is for program type {p}, shift is {}",
                    table.program_type
                )));
            }
        }
        Ok(())
    }

    /// Validate, check exclusivity, and insert one cell. Nothing is written
    /// when any check fails.
    pub async fn create_allocation(&self, input: AllocationInput) -> Result<Allocation, EngineError> {
        let (shift, table) = self.resolve_time_table(input.time_table_id)?;
        let shift_guard = shift.read().await;
        let mut guard = table.write().await;
        if guard.len() >= MAX_ALLOCATIONS_PER_TIMETABLE {
            return Err(EngineError::LimitExceeded("too many allocations in timetable"));
        }
        self.validate_allocation(&shift_guard, &guard, &input)?;

        let conflicts = find_conflicts(&guard, &Candidate::from(&input), None);
        if !conflicts.is_empty() {
            record_conflicts(&conflicts);
            debug!("create rejected in timetable {}: {conflicts:?}", input.time_table_id);
            return Err(EngineError::Conflict(conflicts));
        }

        let allocation = Allocation::from_input(self.next_id(), &input);
        guard.check_unique(&allocation).map_err(unique_violation)?;
        let event = Event::AllocationCreated { allocation };
        self.persist_to_time_table(&mut guard, &event).await?;
        debug!("created allocation {} in timetable {}", allocation.id, allocation.time_table_id);
        Ok(allocation)
    }

    /// Replace the teacher/room/course/section/day/slot of an existing cell.
    /// The row is excluded from its own conflict check.
    pub async fn update_allocation(
        &self,
        id: Id,
        input: AllocationInput,
    ) -> Result<Allocation, EngineError> {
        let time_table_id = self
            .allocation_to_time_table
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(Entity::Allocation, id))?;
        if input.time_table_id != time_table_id {
            return Err(EngineError::Validation(format!(
                "allocation {id} belongs to timetable {time_table_id}, not {}",
                input.time_table_id
            )));
        }
        let (shift, table) = self.resolve_time_table(time_table_id)?;
        let shift_guard = shift.read().await;
        let mut guard = table.write().await;
        if guard.get(id).is_none() {
            return Err(EngineError::NotFound(Entity::Allocation, id));
        }
        self.validate_allocation(&shift_guard, &guard, &input)?;

        let conflicts = find_conflicts(&guard, &Candidate::from(&input), Some(id));
        if !conflicts.is_empty() {
            record_conflicts(&conflicts);
            debug!("update of {id} rejected: {conflicts:?}");
            return Err(EngineError::Conflict(conflicts));
        }

        let allocation = Allocation::from_input(id, &input);
        guard.check_unique(&allocation).map_err(unique_violation)?;
        let event = Event::AllocationUpdated { allocation };
        self.persist_to_time_table(&mut guard, &event).await?;
        debug!("updated allocation {id}");
        Ok(allocation)
    }

    /// Remove one cell unconditionally. Returns the removed row.
    pub async fn delete_allocation(&self, id: Id) -> Result<Allocation, EngineError> {
        let time_table_id = self
            .allocation_to_time_table
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(Entity::Allocation, id))?;
        let table = self
            .get_time_table_state(&time_table_id)
            .ok_or(EngineError::NotFound(Entity::Allocation, id))?;
        let mut guard = table.write().await;
        let allocation = *guard
            .get(id)
            .ok_or(EngineError::NotFound(Entity::Allocation, id))?;
        let event = Event::AllocationDeleted { id, time_table_id };
        self.persist_to_time_table(&mut guard, &event).await?;
        debug!("deleted allocation {id}");
        Ok(allocation)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state.
    ///
    /// Every shift, timetable and the reference data stay read-locked until the
    /// new log is in place, so no write can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _reference_guard = self.reference_gate.write().await;
        let mut events = Vec::new();
        let mut shift_guards = Vec::new();
        let mut table_guards = Vec::new();

        let mut days: Vec<Day> = self.days.iter().map(|e| e.value().clone()).collect();
        days.sort_by_key(|d| d.id);
        events.extend(days.into_iter().map(|day| Event::DayRegistered { day }));

        let mut activation: Vec<((Id, Id), bool)> =
            self.day_activation.iter().map(|e| (*e.key(), *e.value())).collect();
        activation.sort();
        events.extend(activation.into_iter().map(|((institution_id, day_id), active)| {
            Event::DayActivationSet {
                institution_id,
                day_id,
                active,
            }
        }));

        let mut references: Vec<Reference> =
            self.references.iter().map(|e| e.value().clone()).collect();
        references.sort_by_key(|r| (r.kind as u8, r.id));
        events.extend(
            references
                .into_iter()
                .map(|reference| Event::ReferenceRegistered { reference }),
        );

        let mut shift_ids: Vec<Id> = self.shifts.iter().map(|e| *e.key()).collect();
        shift_ids.sort_unstable();
        for shift_id in shift_ids {
            let Some(shift) = self.get_shift(&shift_id) else {
                continue;
            };
            let shift_guard = shift.read_owned().await;
            events.push(Event::ShiftCreated {
                shift: shift_guard.info.clone(),
            });
            for slot in &shift_guard.slots {
                events.push(Event::SlotCreated { slot: slot.clone() });
            }

            let mut time_table_ids = shift_guard.time_tables.clone();
            time_table_ids.sort_unstable();
            for tt_id in time_table_ids {
                let Some(table) = self.get_time_table_state(&tt_id) else {
                    continue;
                };
                let table_guard = table.read_owned().await;
                events.push(Event::TimeTableCreated {
                    time_table: table_guard.info.clone(),
                });
                let mut rows: Vec<Allocation> = table_guard.iter().copied().collect();
                rows.sort_by_key(|a| a.id);
                events.extend(
                    rows.into_iter()
                        .map(|allocation| Event::AllocationCreated { allocation }),
                );
                table_guards.push(table_guard);
            }
            shift_guards.push(shift_guard);
        }
        events.push(Event::IdsReserved {
            next: self.id_high_water(),
        });

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(table_guards);
        drop(shift_guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
