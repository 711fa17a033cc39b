// Tape registry tests
//
// # cargo test registry::test

use chrono::{Duration, Utc};

use tba_api_types::{AllocationPolicy, TapeFormat, TapeStatus};

use crate::store::{Store, StoreError};

use super::TapeRegistry;

const TB: u64 = 1_000_000_000_000;

fn test_registry() -> TapeRegistry {
    TapeRegistry::new(Store::open_in_memory().unwrap())
}

fn label_stamp(registry: &TapeRegistry, tape_id: i64) {
    // mark the tape labeled without going through a device session
    registry
        .store
        .with_conn(|conn| {
            conn.execute(
                "UPDATE tapes SET labeled_at = ?2 WHERE id = ?1",
                rusqlite::params![tape_id, crate::store::ts_to_sql(Utc::now())],
            )?;
            Ok(())
        })
        .unwrap();
}

#[test]
fn sequential_prefers_blank_in_label_order() {
    let registry = test_registry();
    let pool = registry
        .create_pool("p1", 30, AllocationPolicy::Sequential)
        .unwrap();

    let t_active = registry
        .create_tape("AAA000", None, 8, 12 * TB, TapeFormat::Raw)
        .unwrap();
    let t_blank_b = registry
        .create_tape("BBB001", None, 8, 12 * TB, TapeFormat::Raw)
        .unwrap();
    let t_blank_a = registry
        .create_tape("BBB000", None, 8, 12 * TB, TapeFormat::Raw)
        .unwrap();

    for tape in [&t_active, &t_blank_a, &t_blank_b] {
        registry.assign_to_pool(tape.id, pool.id).unwrap();
        label_stamp(&registry, tape.id);
    }
    registry.update_status(t_active.id, TapeStatus::Active).unwrap();

    // oldest-labelled blank wins over any active tape
    let picked = registry.select_best_from_pool(pool.id, 0).unwrap();
    assert_eq!(picked.id, t_blank_a.id);
}

#[test]
fn sequential_falls_back_to_least_used_active() {
    let registry = test_registry();
    let pool = registry
        .create_pool("p1", 30, AllocationPolicy::Sequential)
        .unwrap();

    let t1 = registry
        .create_tape("LBL001", None, 8, 12 * TB, TapeFormat::Raw)
        .unwrap();
    let t2 = registry
        .create_tape("LBL002", None, 8, 12 * TB, TapeFormat::Raw)
        .unwrap();
    for tape in [&t1, &t2] {
        registry.assign_to_pool(tape.id, pool.id).unwrap();
        label_stamp(&registry, tape.id);
        registry.update_status(tape.id, TapeStatus::Active).unwrap();
    }
    registry.update_usage(t1.id, 5 * TB).unwrap();
    registry.update_usage(t2.id, 1 * TB).unwrap();

    let picked = registry.select_best_from_pool(pool.id, 0).unwrap();
    assert_eq!(picked.id, t2.id);
}

#[test]
fn space_greedy_respects_minimum_free() {
    let registry = test_registry();
    let pool = registry
        .create_pool("p1", 30, AllocationPolicy::SpaceGreedy)
        .unwrap();

    let t_small = registry
        .create_tape("LBL001", None, 8, 12 * TB, TapeFormat::Raw)
        .unwrap();
    let t_large = registry
        .create_tape("LBL002", None, 8, 12 * TB, TapeFormat::Raw)
        .unwrap();
    for tape in [&t_small, &t_large] {
        registry.assign_to_pool(tape.id, pool.id).unwrap();
        label_stamp(&registry, tape.id);
        registry.update_status(tape.id, TapeStatus::Active).unwrap();
    }
    registry.update_usage(t_small.id, 11 * TB).unwrap(); // 1 TB free
    registry.update_usage(t_large.id, 4 * TB).unwrap(); // 8 TB free

    // never pick a tape below the minimum when another qualifies
    let picked = registry.select_best_from_pool(pool.id, 2 * TB).unwrap();
    assert_eq!(picked.id, t_large.id);
}

#[test]
fn empty_pool_has_no_tape_available() {
    let registry = test_registry();
    let pool = registry
        .create_pool("p1", 30, AllocationPolicy::Sequential)
        .unwrap();
    assert!(matches!(
        registry.select_best_from_pool(pool.id, 0),
        Err(StoreError::NoTapeAvailable)
    ));
}

#[test]
fn unlabeled_blank_tapes_are_not_writable() {
    let registry = test_registry();
    let pool = registry
        .create_pool("p1", 30, AllocationPolicy::Sequential)
        .unwrap();
    let tape = registry
        .create_tape("LBL001", None, 8, 12 * TB, TapeFormat::Raw)
        .unwrap();
    registry.assign_to_pool(tape.id, pool.id).unwrap();

    // no labeled_at yet
    assert!(matches!(
        registry.select_best_from_pool(pool.id, 0),
        Err(StoreError::NoTapeAvailable)
    ));
}

#[test]
fn status_transition_table_is_enforced() {
    let registry = test_registry();
    let tape = registry
        .create_tape("LBL001", None, 8, 12 * TB, TapeFormat::Raw)
        .unwrap();

    // blank -> full skips active
    assert!(registry.update_status(tape.id, TapeStatus::Full).is_err());

    registry.update_status(tape.id, TapeStatus::Active).unwrap();
    registry.update_status(tape.id, TapeStatus::Full).unwrap();

    // export requires a recorded offsite location
    assert!(registry.update_status(tape.id, TapeStatus::Exported).is_err());
    let exported = registry.mark_exported(tape.id, "vault-7").unwrap();
    assert_eq!(exported.status, TapeStatus::Exported);
    assert_eq!(exported.offsite_location.as_deref(), Some("vault-7"));

    // import restores the pre-export state
    let imported = registry.mark_imported(tape.id).unwrap();
    assert_eq!(imported.status, TapeStatus::Full);
    assert!(imported.offsite_location.is_none());
}

#[test]
fn expiry_requires_elapsed_retention() {
    let registry = test_registry();
    let pool = registry
        .create_pool("p1", 7, AllocationPolicy::Sequential)
        .unwrap();
    let tape = registry
        .create_tape("LBL001", None, 8, 12 * TB, TapeFormat::Raw)
        .unwrap();
    registry.assign_to_pool(tape.id, pool.id).unwrap();
    registry.update_status(tape.id, TapeStatus::Active).unwrap();
    registry.update_status(tape.id, TapeStatus::Full).unwrap();

    // plant a completed set finished just now
    registry
        .store
        .with_conn(|conn| {
            conn.execute(
                "INSERT INTO sources (path, type) VALUES ('/data', 'local')",
                [],
            )?;
            conn.execute(
                "INSERT INTO jobs (name, source_id, pool_id, backup_type, cron, retention_days)
                 VALUES ('j1', 1, ?1, 'full', '0 0 2 * * *', 7)",
                [pool.id],
            )?;
            conn.execute(
                "INSERT INTO backup_sets (job_id, tape_id, backup_type, status, created_at)
                 VALUES (1, ?1, 'full', 'completed', ?2)",
                rusqlite::params![tape.id, crate::store::ts_to_sql(Utc::now())],
            )?;
            Ok(())
        })
        .unwrap();

    assert!(registry.mark_expired(tape.id, Utc::now()).is_err());

    let later = Utc::now() + Duration::days(8);
    let expired = registry.mark_expired(tape.id, later).unwrap();
    assert_eq!(expired.status, TapeStatus::Expired);
}
