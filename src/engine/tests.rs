use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use tokio_test::{assert_err, assert_ok};

use super::*;
use crate::limits::*;

const MON: Id = 1;
const TUE: Id = 2;
const WED: Id = 3;
const INSTITUTION: Id = 1;
const OTHER_INSTITUTION: Id = 2;
const SHIFT: Id = 1;
const TT: Id = 100;

const T1: Id = 10;
const T2: Id = 11;
const R1: Id = 20;
const R2: Id = 21;
const SEC_A: Id = 30;
const SEC_B: Id = 31;
const COURSE: Id = 40;

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("timetabler_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open(path: PathBuf) -> Engine {
    Engine::new(path, Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap()
}

fn slot_input(code: &str, start: NaiveTime, end: NaiveTime) -> SlotInput {
    SlotInput {
        code: code.into(),
        name: format!("Slot {code}"),
        start_time: start,
        end_time: end,
        is_practical: false,
    }
}

/// Mon/Tue/Wed active for the institution, one "Morning BS" shift with a
/// 09:00-10:00 slot, one timetable and a few teachers, rooms and sections.
/// Returns the slot id.
async fn seed(engine: &Engine) -> Id {
    for (id, name) in [(MON, "Monday"), (TUE, "Tuesday"), (WED, "Wednesday")] {
        engine.register_day(id, name.into(), id as u8).await.unwrap();
        engine.set_day_active(INSTITUTION, id, true).await.unwrap();
    }
    engine
        .create_shift(SHIFT, INSTITUTION, "Morning".into(), "BS".into())
        .await
        .unwrap();
    for id in [T1, T2] {
        engine.register_teacher(id, INSTITUTION).await.unwrap();
    }
    for id in [R1, R2] {
        engine.register_room(id, INSTITUTION, Some("BS".into())).await.unwrap();
    }
    for id in [SEC_A, SEC_B] {
        engine.register_section(id, INSTITUTION, Some("BS".into())).await.unwrap();
    }
    engine.register_course(COURSE, INSTITUTION).await.unwrap();
    engine
        .create_time_table(TT, SHIFT, "Fall".into(), None, d(2026, 9, 1), d(2026, 12, 31))
        .await
        .unwrap();
    engine
        .create_slot(SHIFT, slot_input("S1", t(9, 0), t(10, 0)))
        .await
        .unwrap()
        .id
}

fn cell(day: Id, slot: Id, teacher: Id, room: Id, section: Id) -> AllocationInput {
    AllocationInput {
        time_table_id: TT,
        section_id: Some(section),
        day_id: day,
        slot_id: slot,
        teacher_id: Some(teacher),
        room_id: Some(room),
        course_id: Some(COURSE),
    }
}

// ── SlotRegistry ─────────────────────────────────────────

#[tokio::test]
async fn overlapping_slot_rejected_back_to_back_accepted() {
    let engine = open(test_wal_path("slot_overlap.wal"));
    let s1 = seed(&engine).await;

    let err = engine
        .create_slot(SHIFT, slot_input("S2", t(9, 30), t(10, 30)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Overlap(ref ids) if *ids == vec![s1]));
    assert_eq!(err.payload().kind, "overlap");
    assert_eq!(engine.list_slots(SHIFT).await.unwrap().len(), 1);

    let s2 = engine
        .create_slot(SHIFT, slot_input("S2", t(10, 0), t(11, 0)))
        .await
        .unwrap();
    let codes: Vec<String> = engine
        .list_slots(SHIFT)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.code)
        .collect();
    assert_eq!(codes, vec!["S1", "S2"]);
    assert_eq!(engine.get_slot(s2.id).await, Some(s2));
}

#[tokio::test]
async fn zero_nudge_rejects_touching_slots() {
    let engine = Engine::new(
        test_wal_path("slot_zero_nudge.wal"),
        Arc::new(NotifyHub::new()),
        EngineConfig { slot_nudge_secs: 0 },
    )
    .unwrap();
    seed(&engine).await;
    let err = engine
        .create_slot(SHIFT, slot_input("S2", t(10, 0), t(11, 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Overlap(_)));
}

#[tokio::test]
async fn slot_validation() {
    let engine = open(test_wal_path("slot_validation.wal"));
    seed(&engine).await;

    let err = engine
        .create_slot(SHIFT, slot_input("S2", t(11, 0), t(11, 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let err = engine
        .create_slot(99, slot_input("S2", t(11, 0), t(12, 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(Entity::Shift, 99)));
}

#[tokio::test]
async fn update_slot_excludes_itself() {
    let engine = open(test_wal_path("slot_update.wal"));
    let s1 = seed(&engine).await;
    let s2 = engine
        .create_slot(SHIFT, slot_input("S2", t(10, 0), t(11, 0)))
        .await
        .unwrap();

    // Stretching S1 inside its own range is fine
    engine
        .update_slot(s1, slot_input("S1", t(8, 30), t(10, 0)))
        .await
        .unwrap();
    // Stretching it into S2 is not
    let err = engine
        .update_slot(s1, slot_input("S1", t(8, 30), t(10, 30)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Overlap(ref ids) if *ids == vec![s2.id]));

    let err = engine
        .update_slot(999, slot_input("X", t(12, 0), t(13, 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(Entity::Slot, 999)));
}

#[tokio::test]
async fn find_overlapping_is_pure() {
    let engine = open(test_wal_path("slot_find_overlapping.wal"));
    let s1 = seed(&engine).await;
    let hits = engine
        .find_overlapping_slots(SHIFT, t(9, 30), t(10, 30), None)
        .await
        .unwrap();
    assert_eq!(hits.iter().map(|s| s.id).collect::<Vec<_>>(), vec![s1]);
    assert!(engine
        .find_overlapping_slots(SHIFT, t(9, 30), t(10, 30), Some(s1))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(engine.list_slots(SHIFT).await.unwrap().len(), 1);
}

#[tokio::test]
async fn delete_slot_cascades_to_allocations() {
    let engine = open(test_wal_path("slot_cascade.wal"));
    let s1 = seed(&engine).await;
    let s2 = engine
        .create_slot(SHIFT, slot_input("S2", t(10, 0), t(11, 0)))
        .await
        .unwrap()
        .id;

    let a = engine.create_allocation(cell(MON, s1, T1, R1, SEC_A)).await.unwrap();
    let b = engine.create_allocation(cell(TUE, s1, T1, R1, SEC_A)).await.unwrap();
    let keep = engine.create_allocation(cell(MON, s2, T1, R1, SEC_A)).await.unwrap();

    let mut feed = engine.subscribe(TT);
    let removed = engine.delete_slot(s1).await.unwrap();
    assert_eq!(removed, vec![a.id, b.id]);

    for expected in [a.id, b.id] {
        match feed.recv().await.unwrap() {
            Event::AllocationDeleted { id, .. } => assert_eq!(id, expected),
            other => panic!("unexpected event {other:?}"),
        }
    }

    let left: Vec<Id> = engine.list_allocations(TT).await.iter().map(|a| a.id).collect();
    assert_eq!(left, vec![keep.id]);
    assert!(engine.get_slot(s1).await.is_none());
    assert!(matches!(
        engine.delete_slot(s1).await,
        Err(EngineError::NotFound(Entity::Slot, _))
    ));
}

// ── ConflictChecker + AllocationStore ────────────────────

#[tokio::test]
async fn teacher_only_conflict() {
    let engine = open(test_wal_path("teacher_only.wal"));
    let s1 = seed(&engine).await;
    let first = engine.create_allocation(cell(MON, s1, T1, R1, SEC_A)).await.unwrap();

    let err = engine
        .create_allocation(cell(MON, s1, T1, R2, SEC_B))
        .await
        .unwrap_err();
    let payload = err.payload();
    assert_eq!(payload.kind, "conflict");
    assert_eq!(payload.dimensions, Some(vec!["teacher"]));
    assert_eq!(payload.conflicting_ids, Some(vec![first.id]));
    assert_eq!(engine.list_allocations(TT).await.len(), 1);
}

#[tokio::test]
async fn every_violated_dimension_reported() {
    let engine = open(test_wal_path("all_dimensions.wal"));
    let s1 = seed(&engine).await;
    engine.create_allocation(cell(MON, s1, T1, R1, SEC_A)).await.unwrap();

    let err = engine
        .create_allocation(cell(MON, s1, T1, R1, SEC_A))
        .await
        .unwrap_err();
    assert_eq!(
        err.payload().dimensions,
        Some(vec!["teacher", "room", "section"])
    );

    // Same resources on another day are fine
    engine.create_allocation(cell(TUE, s1, T1, R1, SEC_A)).await.unwrap();
}

#[tokio::test]
async fn partial_cells_do_not_conflict() {
    let engine = open(test_wal_path("partial.wal"));
    let s1 = seed(&engine).await;
    let mut partial = cell(MON, s1, T1, R1, SEC_A);
    partial.course_id = None;
    engine.create_allocation(partial).await.unwrap();
    engine.create_allocation(partial).await.unwrap();
    engine.create_allocation(cell(MON, s1, T1, R1, SEC_A)).await.unwrap();
    assert_eq!(engine.list_allocations(TT).await.len(), 3);

    let conflicts = engine
        .find_conflicts(TT, &Candidate::from(&cell(MON, s1, T2, R2, SEC_A)), None)
        .await
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].dimension, Dimension::Section);
}

#[tokio::test]
async fn noop_update_succeeds() {
    let engine = open(test_wal_path("noop_update.wal"));
    let s1 = seed(&engine).await;
    let a = engine.create_allocation(cell(MON, s1, T1, R1, SEC_A)).await.unwrap();
    let updated = engine
        .update_allocation(a.id, cell(MON, s1, T1, R1, SEC_A))
        .await
        .unwrap();
    assert_eq!(updated, a);
}

#[tokio::test]
async fn update_checks_other_rows() {
    let engine = open(test_wal_path("update_conflict.wal"));
    let s1 = seed(&engine).await;
    let a = engine.create_allocation(cell(MON, s1, T1, R1, SEC_A)).await.unwrap();
    let b = engine.create_allocation(cell(MON, s1, T2, R2, SEC_B)).await.unwrap();

    let err = engine
        .update_allocation(b.id, cell(MON, s1, T1, R2, SEC_B))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(ref c) if c[0].allocation_id == a.id));
    assert_eq!(engine.get_allocation(b.id).await, Some(b));

    let moved = engine
        .update_allocation(b.id, cell(TUE, s1, T1, R2, SEC_B))
        .await
        .unwrap();
    assert_eq!(moved.day_id, TUE);

    let err = engine
        .update_allocation(999, cell(MON, s1, T1, R1, SEC_A))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(Entity::Allocation, 999)));
}

#[tokio::test]
async fn delete_allocation_then_not_found() {
    let engine = open(test_wal_path("delete_allocation.wal"));
    let s1 = seed(&engine).await;
    let a = engine.create_allocation(cell(MON, s1, T1, R1, SEC_A)).await.unwrap();
    assert_eq!(engine.delete_allocation(a.id).await.unwrap(), a);
    assert!(matches!(
        engine.delete_allocation(a.id).await,
        Err(EngineError::NotFound(Entity::Allocation, _))
    ));
    assert!(engine.get_allocation(a.id).await.is_none());
    // The cell is free again
    assert_ok!(engine.create_allocation(cell(MON, s1, T1, R1, SEC_A)).await);
}

#[tokio::test]
async fn scope_validation() {
    let engine = open(test_wal_path("scope_validation.wal"));
    let s1 = seed(&engine).await;
    engine.register_teacher(99, OTHER_INSTITUTION).await.unwrap();
    engine.register_room(98, INSTITUTION, Some("INTER".into())).await.unwrap();
    engine.register_day(4, "Thursday".into(), 4).await.unwrap();

    let cases = [
        AllocationInput { teacher_id: Some(99), ..cell(MON, s1, T1, R1, SEC_A) },
        AllocationInput { room_id: Some(98), ..cell(MON, s1, T1, R1, SEC_A) },
        AllocationInput { teacher_id: Some(12345), ..cell(MON, s1, T1, R1, SEC_A) },
        cell(4, s1, T1, R1, SEC_A),
        cell(MON, 777, T1, R1, SEC_A),
        AllocationInput { time_table_id: 555, ..cell(MON, s1, T1, R1, SEC_A) },
    ];
    for input in cases {
        let err = engine.create_allocation(input).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "{input:?} gave {err}");
    }
    assert!(engine.list_allocations(TT).await.is_empty());

    // Deactivating a day takes effect immediately
    engine.set_day_active(INSTITUTION, MON, false).await.unwrap();
    assert!(engine.create_allocation(cell(MON, s1, T1, R1, SEC_A)).await.is_err());
}

#[tokio::test]
async fn timetable_validation() {
    let engine = open(test_wal_path("timetable_validation.wal"));
    seed(&engine).await;
    let err = engine
        .create_time_table(101, SHIFT, "Backwards".into(), None, d(2026, 9, 2), d(2026, 9, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    let err = engine
        .create_time_table(101, 42, "Orphan".into(), None, d(2026, 9, 1), d(2026, 9, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    let err = engine
        .create_time_table(101, SHIFT, "x".repeat(MAX_NAME_LEN + 1), None, d(2026, 9, 1), d(2026, 9, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[tokio::test]
async fn duplicate_timetable_id_across_shifts() {
    let engine = Arc::new(open(test_wal_path("timetable_dup.wal")));
    seed(&engine).await;
    engine
        .create_shift(2, INSTITUTION, "Evening".into(), "BS".into())
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        engine.create_time_table(200, SHIFT, "Morning".into(), None, d(2026, 9, 1), d(2026, 12, 31)),
        engine.create_time_table(200, 2, "Evening".into(), None, d(2026, 9, 1), d(2026, 12, 31)),
    );
    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser, Err(EngineError::Validation(_))));

    let winner = engine.get_time_table(200).await.unwrap();
    let expected_shift = if winner.title == "Morning" { SHIFT } else { 2 };
    assert_eq!(winner.shift_id, expected_shift);

    // Sequential duplicate under another shift is refused too
    let err = engine
        .create_time_table(TT, 2, "Again".into(), None, d(2026, 9, 1), d(2026, 12, 31))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(engine.get_time_table(TT).await.unwrap().title, "Fall");
}

#[tokio::test]
async fn concurrent_creates_one_winner() {
    let engine = Arc::new(open(test_wal_path("concurrent.wal")));
    let s1 = seed(&engine).await;

    let mut handles = Vec::new();
    for section in [SEC_A, SEC_B] {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.create_allocation(cell(MON, s1, T1, R1, section)).await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert!(matches!(e, EngineError::Conflict(_))),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.list_allocations(TT).await.len(), 1);
}

// ── BulkScheduler ────────────────────────────────────────

#[tokio::test]
async fn bulk_apply_partial_failure() {
    let engine = open(test_wal_path("bulk_apply.wal"));
    let s1 = seed(&engine).await;
    // T1 already teaches SEC_B on Tuesday
    let blocker = engine.create_allocation(cell(TUE, s1, T1, R2, SEC_B)).await.unwrap();

    let payload = BulkPayload {
        teacher_id: Some(T1),
        room_id: Some(R1),
        course_id: Some(COURSE),
    };
    let result = engine
        .bulk_apply(TT, s1, Some(SEC_A), &[MON, TUE, WED], payload, &HashMap::new())
        .await
        .unwrap();

    let ok_days: Vec<Id> = result.succeeded().map(|(day, _)| day).collect();
    assert_eq!(ok_days, vec![MON, WED]);
    let failed: Vec<(Id, &EngineError)> = result.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, TUE);
    assert!(matches!(failed[0].1, EngineError::Conflict(c) if c[0].allocation_id == blocker.id));

    let days: Vec<Id> = engine
        .list_allocations(TT)
        .await
        .iter()
        .filter(|a| a.section_id == Some(SEC_A))
        .map(|a| a.day_id)
        .collect();
    assert_eq!(days, vec![MON, WED]);
}

#[tokio::test]
async fn bulk_apply_keeps_caller_order_and_updates_existing() {
    let engine = open(test_wal_path("bulk_update.wal"));
    let s1 = seed(&engine).await;
    let wed = engine.create_allocation(cell(WED, s1, T2, R2, SEC_A)).await.unwrap();

    let payload = BulkPayload {
        teacher_id: Some(T1),
        room_id: Some(R1),
        course_id: Some(COURSE),
    };
    let existing = HashMap::from([(WED, wed.id)]);
    let result = engine
        .bulk_apply(TT, s1, Some(SEC_A), &[WED, MON], payload, &existing)
        .await
        .unwrap();
    let order: Vec<Id> = result.items.iter().map(|(day, _)| *day).collect();
    assert_eq!(order, vec![WED, MON]);
    assert_eq!(result.success_count(), 2);

    let updated = engine.get_allocation(wed.id).await.unwrap();
    assert_eq!(updated.teacher_id, Some(T1));
    assert_eq!(engine.list_allocations(TT).await.len(), 2);
}

#[tokio::test]
async fn bulk_batch_level_errors() {
    let engine = open(test_wal_path("bulk_batch_errors.wal"));
    let s1 = seed(&engine).await;
    let none = HashMap::new();
    let payload = BulkPayload::default();

    assert!(matches!(
        engine.bulk_apply(TT, s1, None, &[], payload, &none).await,
        Err(EngineError::EmptyBatch)
    ));
    assert!(matches!(
        engine.bulk_apply(555, s1, None, &[MON], payload, &none).await,
        Err(EngineError::Validation(_))
    ));
    let too_many: Vec<Id> = (0..=MAX_BATCH_SIZE as Id).collect();
    assert!(matches!(
        engine.bulk_apply(TT, s1, None, &too_many, payload, &none).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(engine.bulk_remove(&[]).await, Err(EngineError::EmptyBatch)));
}

#[tokio::test]
async fn bulk_remove_mixed_ids() {
    let engine = open(test_wal_path("bulk_remove.wal"));
    let s1 = seed(&engine).await;
    let a = engine.create_allocation(cell(MON, s1, T1, R1, SEC_A)).await.unwrap();
    let b = engine.create_allocation(cell(TUE, s1, T1, R1, SEC_A)).await.unwrap();
    engine.delete_allocation(b.id).await.unwrap();

    let result = engine.bulk_remove(&[a.id, b.id, 4242]).await.unwrap();
    let removed: Vec<Id> = result.succeeded().map(|(id, _)| id).collect();
    let failed: Vec<Id> = result.failed().map(|(id, _)| id).collect();
    assert_eq!(removed, vec![a.id]);
    assert_eq!(failed, vec![b.id, 4242]);
    assert!(result
        .failed()
        .all(|(_, e)| matches!(e, EngineError::NotFound(Entity::Allocation, _))));
    assert!(engine.list_allocations(TT).await.is_empty());
}

// ── Window, feed, persistence ────────────────────────────

#[tokio::test]
async fn workload_counts_complete_rows() {
    let engine = open(test_wal_path("workload.wal"));
    let s1 = seed(&engine).await;
    engine.create_allocation(cell(TUE, s1, T1, R1, SEC_A)).await.unwrap();
    engine.create_allocation(cell(MON, s1, T1, R1, SEC_A)).await.unwrap();
    let mut partial = cell(WED, s1, T1, R1, SEC_A);
    partial.room_id = None;
    engine.create_allocation(partial).await.unwrap();

    let workload = engine.teacher_workload(T1, d(2026, 10, 16)).await;
    assert_eq!(workload.len(), 1);
    assert_eq!(workload[0].time_table_id, TT);
    assert_eq!(workload[0].count(), 2);
    let days: Vec<Id> = workload[0].allocations.iter().map(|a| a.day_id).collect();
    assert_eq!(days, vec![MON, TUE]);

    assert!(engine.teacher_workload(T2, d(2026, 10, 16)).await.is_empty());
}

#[tokio::test]
async fn change_feed_sees_writes() {
    let engine = open(test_wal_path("feed.wal"));
    let s1 = seed(&engine).await;
    let mut feed = engine.subscribe(TT);
    let a = engine.create_allocation(cell(MON, s1, T1, R1, SEC_A)).await.unwrap();
    assert_eq!(
        feed.recv().await.unwrap(),
        Event::AllocationCreated { allocation: a }
    );
    // Rejected writes publish nothing
    assert_err!(engine.create_allocation(cell(MON, s1, T1, R1, SEC_A)).await);
    assert_err!(feed.try_recv());
}

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let (s1, a, s2) = {
        let engine = open(path.clone());
        let s1 = seed(&engine).await;
        let a = engine.create_allocation(cell(MON, s1, T1, R1, SEC_A)).await.unwrap();
        let b = engine.create_allocation(cell(TUE, s1, T1, R1, SEC_A)).await.unwrap();
        engine.delete_allocation(b.id).await.unwrap();
        let s2 = engine
            .create_slot(SHIFT, slot_input("S2", t(10, 0), t(11, 0)))
            .await
            .unwrap()
            .id;
        (s1, a, s2)
    };

    let engine = open(path);
    assert_eq!(engine.list_allocations(TT).await, vec![a]);
    assert_eq!(engine.list_slots(SHIFT).await.unwrap().len(), 2);
    assert_eq!(engine.get_time_table(TT).await.unwrap().title, "Fall");

    // Constraints and the id sequence survive the restart
    assert!(matches!(
        engine.create_allocation(cell(MON, s1, T1, R2, SEC_B)).await,
        Err(EngineError::Conflict(_))
    ));
    let next = engine.create_allocation(cell(MON, s2, T1, R1, SEC_A)).await.unwrap();
    assert!(next.id > s2);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let expected = {
        let engine = open(path.clone());
        let s1 = seed(&engine).await;
        for day in [MON, TUE, WED] {
            let a = engine.create_allocation(cell(day, s1, T1, R1, SEC_A)).await.unwrap();
            if day != WED {
                engine.delete_allocation(a.id).await.unwrap();
            }
        }
        engine.set_day_active(INSTITUTION, TUE, false).await.unwrap();
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        engine.list_allocations(TT).await
    };

    let engine = open(path);
    assert_eq!(engine.list_allocations(TT).await, expected);
    let s1 = engine.list_slots(SHIFT).await.unwrap()[0].id;
    assert!(matches!(
        engine.create_allocation(cell(TUE, s1, T2, R2, SEC_B)).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn deleted_ids_not_reissued_after_compaction() {
    let path = test_wal_path("id_high_water.wal");
    let (s1, kept, stale) = {
        let engine = open(path.clone());
        let s1 = seed(&engine).await;
        let kept = engine.create_allocation(cell(MON, s1, T1, R1, SEC_A)).await.unwrap();
        let stale = engine.create_allocation(cell(TUE, s1, T1, R1, SEC_A)).await.unwrap();
        engine.delete_allocation(stale.id).await.unwrap();
        engine.compact_wal().await.unwrap();
        (s1, kept, stale)
    };

    let engine = open(path);
    let fresh = engine.create_allocation(cell(WED, s1, T1, R1, SEC_A)).await.unwrap();
    assert!(fresh.id > stale.id);

    // A stale bulk remove must not touch the new row
    let result = engine.bulk_remove(&[stale.id]).await.unwrap();
    assert_eq!(result.failure_count(), 1);
    assert_eq!(engine.list_allocations(TT).await, vec![kept, fresh]);
}
