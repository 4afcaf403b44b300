//! Dependency resolver: move BLOCKED tasks to QUEUED once their last
//! dependency completes, and heal BLOCKED-but-ready drift on every
//! admission cycle.

use pmstore::{dependency, event, task, EventType, Role, Store, TaskStatus};
use tracing::{debug, info};

/// Called with a newly COMPLETED task. Returns the ids that just became
/// ready (BLOCKED -> QUEUED), after emitting DEPENDENCY_RESOLVED events
/// for observers.
pub fn resolve_on_completion(
    store: &Store,
    project_id: &str,
    order_id: &str,
    completed_task: &str,
) -> pmstore::Result<Vec<String>> {
    store.with_txn(|txn| {
        let mut newly_queued = Vec::new();

        for dependent in dependency::dependents_of(txn, project_id, completed_task)? {
            let Some(dep_task) = task::get_task(txn, project_id, &dependent)? else {
                continue;
            };
            if dep_task.status != TaskStatus::Blocked {
                continue;
            }
            if !dependency::deps_all_completed(txn, project_id, &dependent)? {
                continue;
            }

            task::transition_task(
                txn,
                project_id,
                &dependent,
                TaskStatus::Queued,
                Role::System,
                "DependencyResolver",
                Some(&format!("last dependency {} completed", completed_task)),
            )?;
            event::emit(
                txn,
                project_id,
                Some(order_id),
                EventType::DependencyResolved,
                Some(&dependent),
                None,
            )?;
            newly_queued.push(dependent);
        }

        if !newly_queued.is_empty() {
            info!(
                project_id,
                order_id,
                completed_task,
                unblocked = ?newly_queued,
                "resolve_on_completion: tasks unblocked"
            );
        }
        Ok(newly_queued)
    })
}

/// Reconciliation pass run on every admission cycle: any BLOCKED task whose
/// dependencies are all COMPLETED is drift (a missed resolver call) and is
/// healed here.
pub fn reconcile(store: &Store, project_id: &str, order_id: &str) -> pmstore::Result<Vec<String>> {
    store.with_txn(|txn| {
        let ready = dependency::ready_blocked_tasks(txn, project_id, order_id)?;
        let mut healed = Vec::new();

        for t in ready {
            task::transition_task(
                txn,
                project_id,
                &t.id,
                TaskStatus::Queued,
                Role::System,
                "DependencyResolver",
                Some("reconciliation: dependencies already completed"),
            )?;
            healed.push(t.id);
        }

        if !healed.is_empty() {
            info!(project_id, order_id, healed = ?healed, "reconcile: healed BLOCKED-but-ready drift");
        } else {
            debug!(project_id, order_id, "reconcile: nothing to heal");
        }
        Ok(healed)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmstore::task::{create_task, get_task_required, transition_task, NewTask};
    use pmstore::testutil::{seed_order, seed_project};

    fn make_task(store: &Store, title: &str, deps: &[&str]) -> pmstore::Task {
        create_task(
            store,
            "demo",
            &NewTask {
                order_id: "ORDER_001".to_string(),
                title: title.to_string(),
                depends_on: deps.iter().map(|s| s.to_string()).collect(),
                ..NewTask::default()
            },
        )
        .unwrap()
    }

    fn complete(store: &Store, task_id: &str) {
        store
            .with_txn(|txn| {
                transition_task(txn, "demo", task_id, TaskStatus::InProgress, Role::Worker, "Worker", None)?;
                transition_task(txn, "demo", task_id, TaskStatus::Done, Role::Worker, "Worker", None)?;
                transition_task(txn, "demo", task_id, TaskStatus::Completed, Role::Pm, "PM", None)?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_unblocks_when_last_dep_completes() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");

        let a = make_task(&store, "a", &[]);
        let b = make_task(&store, "b", &[]);
        let c = make_task(&store, "c", &[&a.id, &b.id]);

        complete(&store, &a.id);
        let unblocked = resolve_on_completion(&store, "demo", "ORDER_001", &a.id).unwrap();
        assert!(unblocked.is_empty(), "c still waits on b");

        complete(&store, &b.id);
        let unblocked = resolve_on_completion(&store, "demo", "ORDER_001", &b.id).unwrap();
        assert_eq!(unblocked, vec![c.id.clone()]);

        store
            .read(|conn| {
                assert_eq!(get_task_required(conn, "demo", &c.id)?.status, TaskStatus::Queued);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_emits_dependency_resolved_events() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");

        let a = make_task(&store, "a", &[]);
        let b = make_task(&store, "b", &[&a.id]);

        complete(&store, &a.id);
        resolve_on_completion(&store, "demo", "ORDER_001", &a.id).unwrap();

        store
            .with_txn(|txn| {
                let events = event::consume(txn, "demo", "ORDER_001")?;
                assert!(events
                    .iter()
                    .any(|e| e.event_type == EventType::DependencyResolved
                        && e.task_id.as_deref() == Some(b.id.as_str())));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_reconcile_heals_drift() {
        let store = Store::open_in_memory().unwrap();
        seed_project(&store, "demo");
        seed_order(&store, "demo", "ORDER_001");

        let a = make_task(&store, "a", &[]);
        let b = make_task(&store, "b", &[&a.id]);

        // Complete a without calling the resolver: b is now drifted
        complete(&store, &a.id);

        let healed = reconcile(&store, "demo", "ORDER_001").unwrap();
        assert_eq!(healed, vec![b.id.clone()]);

        // Second pass is a no-op
        assert!(reconcile(&store, "demo", "ORDER_001").unwrap().is_empty());
    }
}
