mod bulk;
mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;
mod store;
#[cfg(test)]
mod tests;
mod window;

pub use bulk::{BulkPayload, BulkResult};
pub use conflict::find_conflicts;
pub use error::{EngineError, ErrorPayload};
pub use slots::{overlapping_slots, SLOT_BOUNDARY_NUDGE_SECS};
pub use store::{TimetableState, UniqueViolation};
pub use window::{is_valid_on, is_valid_today};

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::warn;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedShiftState = Arc<RwLock<ShiftState>>;
pub type SharedTimetableState = Arc<RwLock<TimetableState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The timetable allocation engine for one tenant.
///
/// Slots live in per-shift state and allocations in per-timetable state, each
/// behind its own `RwLock`. Locks are taken shift first, then timetables in
/// ascending id order.
pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) shifts: DashMap<Id, SharedShiftState>,
    pub(super) time_tables: DashMap<Id, SharedTimetableState>,
    pub(super) days: DashMap<Id, Day>,
    /// (institution_id, day_id) → active
    pub(super) day_activation: DashMap<(Id, Id), bool>,
    pub(super) references: DashMap<(RefKind, Id), Reference>,
    /// Reverse lookup: slot id → shift id
    pub(super) slot_to_shift: DashMap<Id, Id>,
    /// Reverse lookup: allocation id → timetable id
    pub(super) allocation_to_time_table: DashMap<Id, Id>,
    /// Reverse lookup: timetable id → shift id
    pub(super) time_table_to_shift: DashMap<Id, Id>,
    /// Reference-data writers share it; compaction takes it exclusively.
    pub(super) reference_gate: RwLock<()>,
    next_id: AtomicU64,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Apply a slot event to a shift. Caller holds the lock.
fn apply_to_shift(shift: &mut ShiftState, event: &Event, slot_index: &DashMap<Id, Id>) {
    match event {
        Event::SlotCreated { slot } => {
            shift.insert_slot(slot.clone());
            slot_index.insert(slot.id, slot.shift_id);
        }
        Event::SlotUpdated { slot } => {
            shift.remove_slot(slot.id);
            shift.insert_slot(slot.clone());
        }
        Event::SlotDeleted { id, .. } => {
            shift.remove_slot(*id);
            slot_index.remove(id);
        }
        Event::TimeTableCreated { time_table } => {
            if !shift.time_tables.contains(&time_table.id) {
                shift.time_tables.push(time_table.id);
            }
        }
        _ => {}
    }
}

/// Apply an allocation event to a timetable. Caller holds the lock.
fn apply_to_time_table(
    table: &mut TimetableState,
    event: &Event,
    allocation_index: &DashMap<Id, Id>,
) {
    match event {
        Event::AllocationCreated { allocation } => {
            if let Err(violations) = table.insert(*allocation) {
                warn!("allocation {} violates {violations:?} on apply", allocation.id);
                return;
            }
            allocation_index.insert(allocation.id, allocation.time_table_id);
        }
        Event::AllocationUpdated { allocation } => {
            if let Err(violations) = table.replace(*allocation) {
                warn!("allocation {} violates {violations:?} on apply", allocation.id);
            }
        }
        Event::AllocationDeleted { id, .. } => {
            table.remove(*id);
            allocation_index.remove(id);
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            config,
            shifts: DashMap::new(),
            time_tables: DashMap::new(),
            days: DashMap::new(),
            day_activation: DashMap::new(),
            references: DashMap::new(),
            slot_to_shift: DashMap::new(),
            allocation_to_time_table: DashMap::new(),
            time_table_to_shift: DashMap::new(),
            reference_gate: RwLock::new(()),
            next_id: AtomicU64::new(1),
            wal_tx,
            notify,
        };

        // Sole owner of these Arcs during replay, so try_write cannot fail.
        // blocking_write would panic: tenants are created inside the runtime.
        for event in &events {
            engine.replay_event(event);
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::SlotCreated { slot } | Event::SlotUpdated { slot } => {
                self.bump_id(slot.id);
                if let Some(entry) = self.shifts.get(&slot.shift_id) {
                    let mut guard = entry.try_write().expect("replay: uncontended write");
                    apply_to_shift(&mut guard, event, &self.slot_to_shift);
                }
            }
            Event::SlotDeleted { id, shift_id } => {
                self.bump_id(*id);
                if let Some(entry) = self.shifts.get(shift_id) {
                    let mut guard = entry.try_write().expect("replay: uncontended write");
                    apply_to_shift(&mut guard, event, &self.slot_to_shift);
                }
            }
            Event::AllocationCreated { allocation } | Event::AllocationUpdated { allocation } => {
                self.bump_id(allocation.id);
                if let Some(entry) = self.time_tables.get(&allocation.time_table_id) {
                    let mut guard = entry.try_write().expect("replay: uncontended write");
                    apply_to_time_table(&mut guard, event, &self.allocation_to_time_table);
                }
            }
            Event::AllocationDeleted { id, time_table_id } => {
                self.bump_id(*id);
                if let Some(entry) = self.time_tables.get(time_table_id) {
                    let mut guard = entry.try_write().expect("replay: uncontended write");
                    apply_to_time_table(&mut guard, event, &self.allocation_to_time_table);
                }
            }
            Event::TimeTableCreated { time_table } => {
                let Some(shift) = self.shifts.get(&time_table.shift_id).map(|e| e.value().clone())
                else {
                    warn!("replay: timetable {} references unknown shift", time_table.id);
                    return;
                };
                let mut guard = shift.try_write().expect("replay: uncontended write");
                self.install_time_table(&mut guard, event, time_table);
            }
            Event::IdsReserved { next } => {
                self.next_id.fetch_max(*next, Ordering::SeqCst);
            }
            other => self.apply_global(other),
        }
    }

    /// Reference-data events touch only the DashMaps.
    fn apply_global(&self, event: &Event) {
        match event {
            Event::DayRegistered { day } => {
                self.days.insert(day.id, day.clone());
            }
            Event::DayActivationSet {
                institution_id,
                day_id,
                active,
            } => {
                self.day_activation.insert((*institution_id, *day_id), *active);
            }
            Event::ReferenceRegistered { reference } => {
                self.references
                    .insert((reference.kind, reference.id), reference.clone());
            }
            Event::ShiftCreated { shift } => {
                self.shifts
                    .entry(shift.id)
                    .or_insert_with(|| Arc::new(RwLock::new(ShiftState::new(shift.clone()))));
            }
            _ => {}
        }
    }

    fn install_time_table(&self, shift: &mut ShiftState, event: &Event, time_table: &TimeTable) {
        apply_to_shift(shift, event, &self.slot_to_shift);
        let table = TimetableState::new(time_table.clone(), &shift.info);
        self.time_table_to_shift.insert(time_table.id, time_table.shift_id);
        self.time_tables
            .insert(time_table.id, Arc::new(RwLock::new(table)));
        self.notify.send(time_table.id, event);
    }

    fn bump_id(&self, seen: Id) {
        self.next_id.fetch_max(seen + 1, Ordering::SeqCst);
    }

    /// First id not yet handed out.
    pub(super) fn id_high_water(&self) -> Id {
        self.next_id.load(Ordering::SeqCst)
    }

    pub(super) fn next_id(&self) -> Id {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply for reference data.
    pub(super) async fn persist_global(&self, event: &Event) -> Result<(), EngineError> {
        let _gate = self.reference_gate.read().await;
        self.wal_append(event).await?;
        self.apply_global(event);
        Ok(())
    }

    /// WAL-append + apply for slot events. Caller holds the shift write lock.
    pub(super) async fn persist_to_shift(
        &self,
        shift: &mut ShiftState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_shift(shift, event, &self.slot_to_shift);
        Ok(())
    }

    /// WAL-append + install for a new timetable. Caller holds the shift write lock.
    pub(super) async fn persist_time_table(
        &self,
        shift: &mut ShiftState,
        event: &Event,
        time_table: &TimeTable,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.install_time_table(shift, event, time_table);
        Ok(())
    }

    /// WAL-append + apply + notify for allocation events. Caller holds the
    /// timetable write lock.
    pub(super) async fn persist_to_time_table(
        &self,
        table: &mut TimetableState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_time_table(table, event, &self.allocation_to_time_table);
        self.notify.send(table.info.id, event);
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn get_shift(&self, id: &Id) -> Option<SharedShiftState> {
        self.shifts.get(id).map(|e| e.value().clone())
    }

    pub fn get_time_table_state(&self, id: &Id) -> Option<SharedTimetableState> {
        self.time_tables.get(id).map(|e| e.value().clone())
    }

    /// Timetable and the shift it is scheduled under, or a validation error
    /// if either is unknown.
    pub(super) fn resolve_time_table(
        &self,
        time_table_id: Id,
    ) -> Result<(SharedShiftState, SharedTimetableState), EngineError> {
        let table = self
            .get_time_table_state(&time_table_id)
            .ok_or_else(|| EngineError::Validation(format!("unknown timetable {time_table_id}")))?;
        let shift_id = self
            .time_table_to_shift
            .get(&time_table_id)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::Validation(format!("unknown timetable {time_table_id}")))?;
        let shift = self
            .get_shift(&shift_id)
            .ok_or(EngineError::NotFound(Entity::Shift, shift_id))?;
        Ok((shift, table))
    }
}
