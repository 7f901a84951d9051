use chrono::NaiveDate;

use crate::model::*;

use super::Engine;

/// Whether `time_table` counts as active on `date`.
///
/// The bounds are joined with OR: a timetable whose start has passed stays
/// valid after its end date, and one that has not started yet is valid too
/// as long as its end is in the future.
pub fn is_valid_on(time_table: &TimeTable, date: NaiveDate) -> bool {
    time_table.start_date <= date || time_table.end_date >= date
}

pub fn is_valid_today(time_table: &TimeTable) -> bool {
    is_valid_on(time_table, chrono::Local::now().date_naive())
}

impl Engine {
    /// Complete allocations of `teacher_id` in every timetable valid on
    /// `date`, ordered by timetable id. Rows inside an entry are ordered by
    /// day, then slot. Timetables without any of the teacher's rows are left
    /// out.
    pub async fn teacher_workload(&self, teacher_id: Id, date: NaiveDate) -> Vec<WorkloadEntry> {
        let mut ids: Vec<Id> = self.time_tables.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();

        let mut entries = Vec::new();
        for id in ids {
            let Some(table) = self.get_time_table_state(&id) else {
                continue;
            };
            let guard = table.read().await;
            if !is_valid_on(&guard.info, date) {
                continue;
            }
            let mut allocations: Vec<Allocation> = guard
                .iter()
                .filter(|a| a.is_complete() && a.teacher_id == Some(teacher_id))
                .copied()
                .collect();
            if allocations.is_empty() {
                continue;
            }
            allocations.sort_by_key(|a| (a.day_id, a.slot_id, a.id));
            entries.push(WorkloadEntry {
                time_table_id: id,
                allocations,
            });
        }
        entries
    }
}
