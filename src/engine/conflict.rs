use crate::model::*;

use super::store::TimetableState;

/// Every exclusivity rule `candidate` would break if written to `table`.
///
/// Only the dimensions present on the candidate are checked, and only against
/// complete rows. `exclude` is the row being updated, so it never conflicts
/// with itself. At most one entry per dimension is returned.
pub fn find_conflicts(
    table: &TimetableState,
    candidate: &Candidate,
    exclude: Option<Id>,
) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    for dimension in Dimension::ALL {
        let Some(value) = dimension.value(candidate) else {
            continue;
        };
        let hit = table
            .cell(candidate.day_id, candidate.slot_id)
            .filter(|a| Some(a.id) != exclude && a.is_complete())
            .filter(|a| dimension.value(&a.candidate()) == Some(value))
            .map(|a| a.id)
            .min();
        if let Some(allocation_id) = hit {
            conflicts.push(Conflict {
                dimension,
                allocation_id,
            });
        }
    }
    conflicts
}
