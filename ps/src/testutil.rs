//! Seeding helpers shared by unit and integration tests.

use crate::db::now_iso;
use crate::Store;

/// Insert a project row directly.
pub fn seed_project(store: &Store, project_id: &str) {
    store
        .with_txn(|txn| {
            txn.execute(
                "INSERT INTO projects (id, name, path, is_active, created_at, updated_at)
                 VALUES (?1, ?1, ?2, 1, ?3, ?3)",
                rusqlite::params![project_id, format!("/tmp/{}", project_id), now_iso()],
            )?;
            Ok(())
        })
        .unwrap_or_else(|e| panic!("seed_project failed: {}", e));
}

/// Insert an order row directly, already IN_PROGRESS.
pub fn seed_order(store: &Store, project_id: &str, order_id: &str) {
    store
        .with_txn(|txn| {
            txn.execute(
                "INSERT INTO orders (id, project_id, title, status, created_at, started_at, updated_at)
                 VALUES (?1, ?2, ?1, 'IN_PROGRESS', ?3, ?3, ?3)",
                rusqlite::params![order_id, project_id, now_iso()],
            )?;
            Ok(())
        })
        .unwrap_or_else(|e| panic!("seed_order failed: {}", e));
}
